//! Outbound dispatch queue.
//!
//! Outreach messages wait here until the mail transport accepts them. Sends
//! are limited by a sliding one-hour window; messages over the limit stay
//! queued for the next drain and are never dropped.

pub mod clock;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::{DispatchQueue, DispatchStats, DrainReport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::common::{MessageId, PropertyRecordId};
use crate::error::{DispatchError, DispatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outreach step a message belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    FirstContact,
    FollowUp,
}

/// Input for [`DispatchQueue::enqueue`].
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct OutboundMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[builder(default)]
    pub kind: MessageKind,
    #[builder(default, setter(strip_option))]
    pub property_id: Option<PropertyRecordId>,
    /// Not sent before this instant
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl OutboundMessage {
    pub fn validate(&self) -> DispatchResult<()> {
        let recipient = self.recipient.trim();
        let well_formed = recipient
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
            && !recipient.contains(char::is_whitespace);
        if !well_formed {
            return Err(DispatchError::Validation(format!(
                "invalid recipient: {:?}",
                self.recipient
            )));
        }
        if self.body.trim().is_empty() {
            return Err(DispatchError::Validation("message body is empty".into()));
        }
        Ok(())
    }
}

/// A message owned by the queue until it is sent or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: MessageId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub kind: MessageKind,
    pub property_id: Option<PropertyRecordId>,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// A message the transport accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub message_id: MessageId,
    pub property_id: Option<PropertyRecordId>,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth another attempt on a later drain
    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// Delivers one message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &QueuedMessage) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(recipient: &str, body: &str) -> OutboundMessage {
        OutboundMessage::builder()
            .recipient(recipient)
            .subject("Facade advertising")
            .body(body)
            .build()
    }

    #[test]
    fn validates_recipient_and_body() {
        assert!(message("info@algade.dk", "Hej").validate().is_ok());
        assert!(message("info.algade.dk", "Hej").validate().is_err());
        assert!(message("info@localhost", "Hej").validate().is_err());
        assert!(message("in fo@algade.dk", "Hej").validate().is_err());
        assert!(message("info@algade.dk", "   ").validate().is_err());
    }
}
