//! Outreach lifecycle of CRM property records.
//!
//! [`machine`] holds the pure status machine. The functions here load a
//! record, apply an event and persist the resulting status.

pub mod machine;

pub use machine::{OutreachEvent, OutreachStatus};

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::common::PropertyRecordId;
use crate::crm::{CrmFilter, CrmStore, PropertyRecord, PropertyRecordUpdate};
use crate::dispatch::{Delivery, MessageKind};
use crate::error::WorkflowResult;
use crate::staging::{StageCounts, StagingStore};

/// Apply one outreach event to a CRM record and persist the new status.
pub async fn apply_event<C>(
    crm: &C,
    id: &PropertyRecordId,
    event: OutreachEvent,
) -> WorkflowResult<PropertyRecord>
where
    C: CrmStore + ?Sized,
{
    let record = crm.get(id).await?;
    let next = record.outreach_status.apply(event)?;
    if next == record.outreach_status {
        return Ok(record);
    }

    let updated = crm.update(id, PropertyRecordUpdate::status(next)).await?;
    debug!(
        property_id = %id,
        from = %record.outreach_status,
        to = %next,
        "Outreach status advanced"
    );
    Ok(updated)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub advanced: Vec<PropertyRecordId>,
    pub failed: Vec<(PropertyRecordId, String)>,
}

/// Advance outreach status for delivered messages.
///
/// First-contact deliveries move a record to `FOERSTE_MAIL_SENDT`, follow-ups
/// to `OPFOELGNING_SENDT`. A record that refuses the event is reported and
/// the rest continue.
pub async fn record_deliveries<C>(crm: &C, delivered: &[Delivery]) -> DeliveryUpdate
where
    C: CrmStore + ?Sized,
{
    let mut update = DeliveryUpdate::default();

    for delivery in delivered {
        let Some(property_id) = &delivery.property_id else {
            continue;
        };
        let event = match delivery.kind {
            MessageKind::FirstContact => OutreachEvent::FirstMailSent,
            MessageKind::FollowUp => OutreachEvent::FollowUpSent,
        };

        match apply_event(crm, property_id, event).await {
            Ok(_) => update.advanced.push(property_id.clone()),
            Err(e) => {
                warn!(
                    property_id = %property_id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Delivered message could not advance outreach status"
                );
                update.failed.push((property_id.clone(), e.to_string()));
            }
        }
    }

    update
}

/// Dashboard summary across staging and the CRM.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOverview {
    pub stage_counts: StageCounts,
    pub outreach_counts: BTreeMap<OutreachStatus, usize>,
    /// Sources that could not be read, with the reason
    pub errors: Vec<String>,
}

/// Counts per staging stage and per outreach status.
///
/// Never fails: an unreachable store leaves its counts at zero and adds a
/// message to `errors`.
pub async fn pipeline_overview<S, C>(staging: &S, crm: &C) -> PipelineOverview
where
    S: StagingStore + ?Sized,
    C: CrmStore + ?Sized,
{
    let mut overview = PipelineOverview {
        outreach_counts: OutreachStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
        ..Default::default()
    };

    match staging.counts().await {
        Ok(counts) => overview.stage_counts = counts,
        Err(e) => {
            warn!(error = %e, "Staging counts unavailable");
            overview.errors.push(format!("staging: {}", e));
        }
    }

    match crm.list(&CrmFilter::default()).await {
        Ok(records) => {
            for record in records {
                *overview
                    .outreach_counts
                    .entry(record.outreach_status)
                    .or_insert(0) += 1;
            }
        }
        Err(e) => {
            warn!(error = %e, "CRM records unavailable");
            overview.errors.push(format!("crm: {}", e));
        }
    }

    info!(
        staged = overview.stage_counts.total(),
        errors = overview.errors.len(),
        "Pipeline overview computed"
    );
    overview
}
