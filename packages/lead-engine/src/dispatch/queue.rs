//! Rate-limited outbound queue.
//!
//! Messages live in a FIFO behind an async mutex. Send reservations are
//! taken from a sliding one-hour window before the transport is called and
//! handed back when the send does not go through, so only successful sends
//! count against the limit. Counters are atomics so [`DispatchQueue::stats`]
//! never waits on a drain in progress.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Clock, Delivery, MailTransport, MessageStatus, OutboundMessage, QueuedMessage, SystemClock,
    TransportError,
};
use crate::common::MessageId;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub queued: usize,
    pub sent: usize,
    pub failed: usize,
    /// Sends inside the trailing hour as counted by the most recent drain.
    /// Not recomputed between drains, so it can overstate once the window
    /// has slid past older sends.
    pub sent_this_hour: usize,
    pub rate_limit_per_hour: u32,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub sent: usize,
    /// Transient failures returned to the queue
    pub retried: usize,
    pub failed: usize,
    /// Due messages left queued because the window was full
    pub deferred: usize,
    pub delivered: Vec<Delivery>,
}

#[derive(Default)]
struct Messages {
    /// Queued and sending ids in FIFO order
    order: VecDeque<MessageId>,
    by_id: HashMap<MessageId, QueuedMessage>,
    /// Sent and failed ids, oldest first
    finished: VecDeque<MessageId>,
}

impl Messages {
    /// Take a message out of the FIFO and keep it for lookups, evicting
    /// the oldest finished records beyond `retain`.
    fn retire(&mut self, id: MessageId, retain: usize) {
        if let Some(pos) = self.order.iter().position(|m| *m == id) {
            self.order.remove(pos);
        }
        self.finished.push_back(id);
        while self.finished.len() > retain {
            if let Some(old) = self.finished.pop_front() {
                self.by_id.remove(&old);
            }
        }
    }
}

pub struct DispatchQueue {
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retained_messages: usize,
    messages: Mutex<Messages>,
    /// Send instants inside the trailing hour, ascending
    window: Mutex<VecDeque<DateTime<Utc>>>,

    queued: AtomicUsize,
    sent: AtomicUsize,
    failed: AtomicUsize,
    sent_this_hour: AtomicUsize,
    rate_limit_per_hour: AtomicU32,
}

impl DispatchQueue {
    pub fn new(transport: Arc<dyn MailTransport>, config: &DispatchConfig) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            max_attempts: config.max_attempts.max(1),
            retained_messages: config.retained_messages,
            messages: Mutex::new(Messages::default()),
            window: Mutex::new(VecDeque::new()),
            queued: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            sent_this_hour: AtomicUsize::new(0),
            rate_limit_per_hour: AtomicU32::new(config.rate_limit_per_hour),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn enqueue(&self, message: OutboundMessage) -> DispatchResult<MessageId> {
        message.validate()?;
        let now = self.clock.now();
        let queued = QueuedMessage {
            id: MessageId::new(),
            recipient: message.recipient.trim().to_string(),
            subject: message.subject,
            body: message.body,
            kind: message.kind,
            property_id: message.property_id,
            status: MessageStatus::Queued,
            scheduled_at: message.scheduled_at.unwrap_or(now),
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            sent_at: None,
        };
        let id = queued.id;

        let mut messages = self.messages.lock().await;
        messages.order.push_back(id);
        messages.by_id.insert(id, queued);
        self.queued.fetch_add(1, Ordering::SeqCst);

        debug!(message_id = %id, "Message queued");
        Ok(id)
    }

    /// Look up a message. Sent and failed messages stay available until
    /// `retained_messages` newer ones have finished.
    pub async fn message(&self, id: MessageId) -> DispatchResult<QueuedMessage> {
        self.messages
            .lock()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DispatchError::NotFound(id))
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.queued.load(Ordering::SeqCst),
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            sent_this_hour: self.sent_this_hour.load(Ordering::SeqCst),
            rate_limit_per_hour: self.rate_limit_per_hour.load(Ordering::SeqCst),
        }
    }

    /// Send due messages in FIFO order until the window is full.
    ///
    /// Messages that fail transiently go back to the queue and are picked
    /// up by the next drain, not this one.
    pub async fn drain(&self, rate_limit_per_hour: u32) -> DrainReport {
        self.rate_limit_per_hour
            .store(rate_limit_per_hour, Ordering::SeqCst);
        let started = self.clock.now();
        self.prune_window(started).await;
        let mut report = DrainReport::default();

        let due = self.due_messages(started).await;
        let mut pending = due.into_iter();

        while let Some(id) = pending.next() {
            // Sends can be slow, so every reservation reads the clock itself
            let reserved_at = self.clock.now();
            if !self.reserve(reserved_at, rate_limit_per_hour).await {
                report.deferred = 1 + pending.len();
                break;
            }

            let Some(message) = self.claim(id).await else {
                // Claimed by a concurrent drain
                self.release(reserved_at).await;
                continue;
            };

            match self.transport.send(&message).await {
                Ok(()) => {
                    let sent_at = self.clock.now();
                    self.settle(reserved_at, sent_at).await;
                    self.finish(id, Ok(sent_at)).await;
                    report.sent += 1;
                    report.delivered.push(Delivery {
                        message_id: id,
                        property_id: message.property_id.clone(),
                        kind: message.kind,
                    });
                    debug!(message_id = %id, "Message sent");
                }
                Err(e) => {
                    self.release(reserved_at).await;
                    match self.finish(id, Err(e)).await {
                        MessageStatus::Failed => report.failed += 1,
                        _ => report.retried += 1,
                    }
                }
            }
        }

        if report.deferred > 0 {
            warn!(
                deferred = report.deferred,
                rate_limit_per_hour, "Hourly send limit reached; messages stay queued"
            );
        }
        info!(
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            "Dispatch drain finished"
        );
        report
    }

    async fn due_messages(&self, now: DateTime<Utc>) -> Vec<MessageId> {
        let messages = self.messages.lock().await;
        messages
            .order
            .iter()
            .filter(|id| {
                messages
                    .by_id
                    .get(id)
                    .is_some_and(|m| m.status == MessageStatus::Queued && m.scheduled_at <= now)
            })
            .copied()
            .collect()
    }

    fn evict_expired(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(1);
        while window.front().is_some_and(|t| *t <= horizon) {
            window.pop_front();
        }
    }

    fn insert_sorted(window: &mut VecDeque<DateTime<Utc>>, at: DateTime<Utc>) {
        let pos = window.partition_point(|t| *t <= at);
        window.insert(pos, at);
    }

    async fn prune_window(&self, now: DateTime<Utc>) {
        let mut window = self.window.lock().await;
        Self::evict_expired(&mut window, now);
        self.sent_this_hour.store(window.len(), Ordering::SeqCst);
    }

    /// Check-and-reserve one slot in the trailing hour.
    async fn reserve(&self, now: DateTime<Utc>, limit: u32) -> bool {
        let mut window = self.window.lock().await;
        Self::evict_expired(&mut window, now);

        let granted = window.len() < limit as usize;
        if granted {
            Self::insert_sorted(&mut window, now);
        }
        self.sent_this_hour.store(window.len(), Ordering::SeqCst);
        granted
    }

    async fn release(&self, reserved_at: DateTime<Utc>) {
        let mut window = self.window.lock().await;
        if let Some(pos) = window.iter().rposition(|t| *t == reserved_at) {
            window.remove(pos);
        }
        self.sent_this_hour.store(window.len(), Ordering::SeqCst);
    }

    /// Move a reservation to the instant the send completed.
    async fn settle(&self, reserved_at: DateTime<Utc>, sent_at: DateTime<Utc>) {
        let mut window = self.window.lock().await;
        if let Some(pos) = window.iter().rposition(|t| *t == reserved_at) {
            window.remove(pos);
        }
        Self::insert_sorted(&mut window, sent_at);
        self.sent_this_hour.store(window.len(), Ordering::SeqCst);
    }

    /// Move a queued message to `sending`.
    async fn claim(&self, id: MessageId) -> Option<QueuedMessage> {
        let mut messages = self.messages.lock().await;
        let message = messages.by_id.get_mut(&id)?;
        if message.status != MessageStatus::Queued {
            return None;
        }
        message.status = MessageStatus::Sending;
        message.attempts += 1;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(message.clone())
    }

    async fn finish(
        &self,
        id: MessageId,
        outcome: Result<DateTime<Utc>, TransportError>,
    ) -> MessageStatus {
        let mut messages = self.messages.lock().await;
        let Some(message) = messages.by_id.get_mut(&id) else {
            return MessageStatus::Failed;
        };

        match outcome {
            Ok(sent_at) => {
                message.status = MessageStatus::Sent;
                message.sent_at = Some(sent_at);
                message.last_error = None;
                self.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(TransportError::Transient(reason)) if message.attempts < self.max_attempts => {
                warn!(
                    message_id = %id,
                    attempt = message.attempts,
                    error = %reason,
                    "Transient send failure; message requeued"
                );
                message.status = MessageStatus::Queued;
                message.last_error = Some(reason);
                self.queued.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(
                    message_id = %id,
                    attempts = message.attempts,
                    error = %e,
                    "Message failed"
                );
                message.status = MessageStatus::Failed;
                message.last_error = Some(e.to_string());
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let status = message.status;
        if status.is_terminal() {
            messages.retire(id, self.retained_messages);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualClock;
    use crate::testing::MockMailTransport;

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig::builder()
            .rate_limit_per_hour(10u32)
            .max_attempts(max_attempts)
            .build()
    }

    fn message(n: usize) -> OutboundMessage {
        OutboundMessage::builder()
            .recipient(format!("owner{n}@example.dk"))
            .subject("Facade")
            .body("Hej")
            .build()
    }

    #[tokio::test]
    async fn transient_failures_retry_until_budget_is_spent() {
        let transport = Arc::new(MockMailTransport::new().with_transient_failures(5));
        let queue = DispatchQueue::new(transport.clone(), &config(3));
        let id = queue.enqueue(message(1)).await.unwrap();

        let first = queue.drain(10).await;
        assert_eq!(first.retried, 1);
        assert_eq!(queue.message(id).await.unwrap().status, MessageStatus::Queued);

        queue.drain(10).await;
        let third = queue.drain(10).await;
        assert_eq!(third.failed, 1);

        let failed = queue.message(id).await.unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.stats().sent_this_hour, 0);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let transport = Arc::new(MockMailTransport::new().with_permanent_failure("owner1@example.dk"));
        let queue = DispatchQueue::new(transport, &config(3));
        let id = queue.enqueue(message(1)).await.unwrap();

        let report = queue.drain(10).await;
        assert_eq!(report.failed, 1);
        assert_eq!(queue.message(id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn scheduled_messages_wait_for_their_time() {
        let clock = Arc::new(ManualClock::default());
        let transport = Arc::new(MockMailTransport::new());
        let queue = DispatchQueue::new(transport, &config(3)).with_clock(clock.clone());

        let later = OutboundMessage::builder()
            .recipient("owner@example.dk")
            .subject("Follow-up")
            .body("Hej igen")
            .scheduled_at(clock.now() + Duration::days(3))
            .build();
        let id = queue.enqueue(later).await.unwrap();

        assert_eq!(queue.drain(10).await.sent, 0);
        clock.advance(Duration::days(3));
        assert_eq!(queue.drain(10).await.sent, 1);
        assert!(queue.message(id).await.unwrap().sent_at.is_some());
    }

    /// Transport whose first `slow_sends` sends each take `delay` of clock time.
    struct SlowTransport {
        clock: Arc<ManualClock>,
        delay: Duration,
        slow_sends: AtomicU32,
    }

    #[async_trait::async_trait]
    impl MailTransport for SlowTransport {
        async fn send(&self, _message: &QueuedMessage) -> Result<(), TransportError> {
            let slow = self
                .slow_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if slow {
                self.clock.advance(self.delay);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_sends_count_from_when_they_complete() {
        let clock = Arc::new(ManualClock::default());
        let start = clock.now();
        let transport = Arc::new(SlowTransport {
            clock: clock.clone(),
            delay: Duration::minutes(5),
            slow_sends: AtomicU32::new(10),
        });
        let queue = DispatchQueue::new(transport, &config(3)).with_clock(clock.clone());
        let mut ids = Vec::new();
        for n in 0..20 {
            ids.push(queue.enqueue(message(n)).await.unwrap());
        }

        let first = queue.drain(10).await;
        assert_eq!(first.sent, 10);
        assert_eq!(first.deferred, 10);
        let last_send = queue.message(ids[9]).await.unwrap().sent_at.unwrap();
        assert_eq!(last_send, start + Duration::minutes(50));

        // An hour after the drain began, but the later sends are still recent
        clock.set(start + Duration::minutes(60) + Duration::seconds(1));
        let second = queue.drain(10).await;
        assert_eq!(second.sent, 0);

        clock.set(last_send + Duration::minutes(60) + Duration::seconds(1));
        assert_eq!(queue.drain(10).await.sent, 10);

        let mut sent: Vec<_> = Vec::new();
        for id in &ids {
            sent.push(queue.message(*id).await.unwrap().sent_at.unwrap());
        }
        for t in &sent {
            let in_window = sent
                .iter()
                .filter(|s| **s <= *t && **s > *t - Duration::hours(1))
                .count();
            assert!(in_window <= 10, "{in_window} sends in the hour ending {t}");
        }
    }

    #[tokio::test]
    async fn finished_messages_leave_the_queue_and_age_out() {
        let config = DispatchConfig::builder()
            .rate_limit_per_hour(10u32)
            .retained_messages(2usize)
            .build();
        let queue = DispatchQueue::new(Arc::new(MockMailTransport::new()), &config);
        let first = queue.enqueue(message(1)).await.unwrap();
        let second = queue.enqueue(message(2)).await.unwrap();
        let third = queue.enqueue(message(3)).await.unwrap();

        assert_eq!(queue.drain(10).await.sent, 3);

        assert!(matches!(
            queue.message(first).await,
            Err(DispatchError::NotFound(_))
        ));
        assert_eq!(queue.message(second).await.unwrap().status, MessageStatus::Sent);
        assert_eq!(queue.message(third).await.unwrap().status, MessageStatus::Sent);

        let messages = queue.messages.lock().await;
        assert!(messages.order.is_empty());
        assert_eq!(messages.by_id.len(), 2);
    }

    #[tokio::test]
    async fn sent_this_hour_is_refreshed_by_the_next_drain() {
        let clock = Arc::new(ManualClock::default());
        let queue = DispatchQueue::new(Arc::new(MockMailTransport::new()), &config(3))
            .with_clock(clock.clone());
        queue.enqueue(message(1)).await.unwrap();
        queue.enqueue(message(2)).await.unwrap();
        queue.drain(10).await;
        assert_eq!(queue.stats().sent_this_hour, 2);

        clock.advance(Duration::minutes(61));
        assert_eq!(queue.stats().sent_this_hour, 2);

        // Nothing queued, the drain still slides the window
        let report = queue.drain(10).await;
        assert_eq!(report.sent, 0);
        assert_eq!(queue.stats().sent_this_hour, 0);
        assert_eq!(queue.stats().sent, 2);
    }

    #[tokio::test]
    async fn rejects_malformed_recipient() {
        let queue = DispatchQueue::new(Arc::new(MockMailTransport::new()), &config(3));
        let err = queue
            .enqueue(
                OutboundMessage::builder()
                    .recipient("not-an-address")
                    .subject("x")
                    .body("y")
                    .build(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(queue.stats().queued, 0);
    }
}
