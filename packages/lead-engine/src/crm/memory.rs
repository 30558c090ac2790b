//! In-memory CRM.
//!
//! Stores raw field maps, not typed records, so every read and write goes
//! through the same translation layer a real CRM adapter would use.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::fields::{self, FieldMap};
use super::{CrmFilter, CrmStore, NewPropertyRecord, PropertyRecord, PropertyRecordUpdate};
use crate::common::PropertyRecordId;
use crate::error::{CollaboratorError, CrmError, CrmResult};

#[derive(Default)]
pub struct MemoryCrmStore {
    records: RwLock<HashMap<PropertyRecordId, FieldMap>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryCrmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a transient error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a raw field, bypassing the typed layer.
    pub async fn put_raw_field(
        &self,
        id: &PropertyRecordId,
        field: &str,
        value: serde_json::Value,
    ) -> CrmResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| CrmError::NotFound(id.clone()))?;
        record.insert(field.to_string(), value);
        Ok(())
    }

    pub async fn raw_fields(&self, id: &PropertyRecordId) -> Option<FieldMap> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn check_available(&self) -> CrmResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::transient("crm", "service unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl CrmStore for MemoryCrmStore {
    async fn create(&self, record: NewPropertyRecord) -> CrmResult<PropertyRecord> {
        self.check_available()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = PropertyRecordId::new(format!("rec-{}", n));
        let raw = record.to_fields(Utc::now());

        let created = PropertyRecord::from_fields(id.clone(), &raw)?;
        self.records.write().await.insert(id, raw);
        Ok(created)
    }

    async fn get(&self, id: &PropertyRecordId) -> CrmResult<PropertyRecord> {
        self.check_available()?;
        let records = self.records.read().await;
        let raw = records
            .get(id)
            .ok_or_else(|| CrmError::NotFound(id.clone()))?;
        PropertyRecord::from_fields(id.clone(), raw)
    }

    async fn update(
        &self,
        id: &PropertyRecordId,
        update: PropertyRecordUpdate,
    ) -> CrmResult<PropertyRecord> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let raw = records
            .get_mut(id)
            .ok_or_else(|| CrmError::NotFound(id.clone()))?;

        let mut merged = raw.clone();
        merged.extend(update.to_fields());
        if let Ok(now) = serde_json::to_value(Utc::now()) {
            merged.insert(fields::UPDATED_AT.to_string(), now);
        }

        // Validate before committing so a bad write leaves the record intact
        let updated = PropertyRecord::from_fields(id.clone(), &merged)?;
        *raw = merged;
        Ok(updated)
    }

    async fn list(&self, filter: &CrmFilter) -> CrmResult<Vec<PropertyRecord>> {
        self.check_available()?;
        let records = self.records.read().await;
        let mut matching = Vec::new();
        for (id, raw) in records.iter() {
            let record = PropertyRecord::from_fields(id.clone(), raw)?;
            if filter.matches(&record) {
                matching.push(record);
            }
        }

        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}
