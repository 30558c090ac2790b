//! Bulk operations over the staging store.
//!
//! Bulk reject is an at-least-effort batch: each id is rejected through its
//! own `update` call, failures are collected per id, and nothing is rolled
//! back when one of them fails.

use serde::Serialize;
use tracing::{info, warn};

use super::{Stage, StagedPropertyPatch, StagingStore};
use crate::common::StagedPropertyId;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRejectReport {
    pub rejected: Vec<StagedPropertyId>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub id: StagedPropertyId,
    pub reason: String,
}

impl BulkRejectReport {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

pub async fn bulk_reject<S>(store: &S, ids: &[StagedPropertyId]) -> BulkRejectReport
where
    S: StagingStore + ?Sized,
{
    let mut report = BulkRejectReport::default();

    for id in ids {
        match store
            .update(*id, StagedPropertyPatch::stage(Stage::Rejected))
            .await
        {
            Ok(_) => report.rejected.push(*id),
            Err(e) => {
                warn!(id = %id, error = %e, "Bulk reject skipped property");
                report.failed.push(BulkFailure {
                    id: *id,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        rejected = report.rejected_count(),
        failed = report.failed_count(),
        "Bulk reject finished"
    );
    report
}
