//! In-memory staging store.
//!
//! Useful for tests, local runs, and as the reference implementation of
//! the [`StagingStore`] contract.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    apply_patch, NewStagedProperty, Stage, StageCounts, StagedProperty, StagedPropertyPatch,
    StagingFilter, StagingStore,
};
use crate::common::StagedPropertyId;
use crate::error::{StagingError, StagingResult};
use crate::identity::{normalize_address, CanonicalKey, PropertyIdentity};

#[derive(Default)]
pub struct MemoryStagingStore {
    properties: RwLock<HashMap<StagedPropertyId, StagedProperty>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.properties.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.properties.read().await.is_empty()
    }
}

/// Active holder of `key`, ignoring rejected records and `exclude`.
fn find_active_holder<'a>(
    properties: &'a HashMap<StagedPropertyId, StagedProperty>,
    key: &CanonicalKey,
    exclude: Option<StagedPropertyId>,
) -> Option<&'a StagedProperty> {
    properties.values().find(|p| {
        p.stage != Stage::Rejected && Some(p.id) != exclude && &p.canonical_key() == key
    })
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn insert(&self, candidate: NewStagedProperty) -> StagingResult<StagedProperty> {
        candidate.validate()?;
        let key = candidate.canonical_key();

        let mut properties = self.properties.write().await;
        if let Some(existing) = find_active_holder(&properties, &key, None) {
            return Err(StagingError::Conflict {
                key,
                existing: existing.id,
            });
        }

        let property = candidate.into_staged(Utc::now());
        debug!(id = %property.id, key = %key, "Staged property inserted");
        properties.insert(property.id, property.clone());
        Ok(property)
    }

    async fn get(&self, id: StagedPropertyId) -> StagingResult<StagedProperty> {
        self.properties
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StagingError::NotFound(id))
    }

    async fn list(&self, filter: &StagingFilter) -> StagingResult<Vec<StagedProperty>> {
        let properties = self.properties.read().await;
        let mut matching: Vec<_> = properties
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn update(
        &self,
        id: StagedPropertyId,
        patch: StagedPropertyPatch,
    ) -> StagingResult<StagedProperty> {
        let mut properties = self.properties.write().await;
        let current = properties.get(&id).ok_or(StagingError::NotFound(id))?;

        let touches_identity = patch.touches_identity();
        let updated = apply_patch(current, patch, Utc::now())?;

        if touches_identity && updated.stage != Stage::Rejected {
            let key = updated.canonical_key();
            if let Some(existing) = find_active_holder(&properties, &key, Some(id)) {
                return Err(StagingError::Conflict {
                    key,
                    existing: existing.id,
                });
            }
        }

        debug!(id = %id, stage = %updated.stage, "Staged property updated");
        properties.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: StagedPropertyId) -> StagingResult<bool> {
        Ok(self.properties.write().await.remove(&id).is_some())
    }

    async fn counts(&self) -> StagingResult<StageCounts> {
        let mut counts = StageCounts::default();
        for property in self.properties.read().await.values() {
            counts.increment(property.stage);
        }
        Ok(counts)
    }

    async fn exists_by_address(&self, address: &str) -> StagingResult<bool> {
        let needle = normalize_address(address);
        Ok(self
            .properties
            .read()
            .await
            .values()
            .any(|p| p.stage != Stage::Rejected && normalize_address(&p.address) == needle))
    }
}
