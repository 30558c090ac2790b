//! Hand-off from staging to the CRM.

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::{info, warn};

use super::{Stage, StagedProperty, StagedPropertyPatch, StagingStore};
use crate::common::StagedPropertyId;
use crate::crm::{CrmFilter, CrmStore, NewPropertyRecord, PropertyRecord};
use crate::error::{PushError, PushResult, StagingError};

lazy_static! {
    /// Staged properties with a push under way in this process
    static ref PUSHES_IN_FLIGHT: DashMap<StagedPropertyId, ()> = DashMap::new();
}

/// Holds a staged property's push slot until dropped.
struct PushGuard {
    id: StagedPropertyId,
}

impl PushGuard {
    fn acquire(id: StagedPropertyId) -> Option<Self> {
        match PUSHES_IN_FLIGHT.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { id })
            }
        }
    }
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        PUSHES_IN_FLIGHT.remove(&self.id);
    }
}

/// Push an approved staged property to the CRM.
///
/// Creates the CRM record at `NY_KRAEVER_RESEARCH`, then moves the staged
/// property to `pushed` with the CRM id attached. Returns both records.
///
/// A concurrent push of the same property fails with `InProgress`. A CRM
/// record left behind by an earlier push whose staging update failed is
/// reused instead of creating a second one.
pub async fn push_to_crm<S, C>(
    staging: &S,
    crm: &C,
    id: StagedPropertyId,
) -> PushResult<(StagedProperty, PropertyRecord)>
where
    S: StagingStore + ?Sized,
    C: CrmStore + ?Sized,
{
    let _guard = PushGuard::acquire(id).ok_or(PushError::InProgress(id))?;

    let staged = staging.get(id).await?;
    if staged.stage != Stage::Approved {
        return Err(StagingError::InvalidTransition {
            from: staged.stage,
            to: Stage::Pushed,
        }
        .into());
    }

    let earlier = crm
        .list(
            &CrmFilter::builder()
                .staged_property_id(id)
                .limit(1usize)
                .build(),
        )
        .await?
        .into_iter()
        .next();

    let record = match earlier {
        Some(record) => {
            info!(staged_id = %id, crm_id = %record.id, "Reusing CRM record from an earlier push");
            record
        }
        None => {
            let mut new_record = NewPropertyRecord::builder()
                .name(staged.address.clone())
                .address(staged.address.clone())
                .staged_property_id(staged.id)
                .build();
            new_record.postal_code = staged.postal_code.clone();
            new_record.city = staged.city.clone();
            new_record.bfe = staged.bfe.clone();
            new_record.outdoor_score = staged.outdoor_score;

            crm.create(new_record).await?
        }
    };

    let patch = StagedPropertyPatch {
        crm_property_id: Some(record.id.clone()),
        ..StagedPropertyPatch::stage(Stage::Pushed)
    };
    let pushed = match staging.update(id, patch).await {
        Ok(pushed) => pushed,
        Err(e) => {
            // Retrying the push picks this CRM record up again
            warn!(
                staged_id = %id,
                crm_id = %record.id,
                error = %e,
                "CRM record created but staged property could not be marked pushed"
            );
            return Err(e.into());
        }
    };

    info!(staged_id = %id, crm_id = %record.id, "Pushed staged property to CRM");
    Ok((pushed, record))
}
