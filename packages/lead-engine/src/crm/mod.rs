//! External CRM boundary.
//!
//! The CRM owns durable property records. The engine only ever sees the
//! typed [`PropertyRecord`]; translation to and from the CRM's loosely typed
//! field maps happens in [`fields`].

pub mod fields;
pub mod memory;

pub use fields::FieldMap;
pub use memory::MemoryCrmStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{PropertyRecordId, StagedPropertyId};
use crate::error::CrmResult;
use crate::identity::PropertyIdentity;
use crate::outreach::OutreachStatus;

/// How much of the research was backed by real data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Low,
    Medium,
    High,
}

/// A person worth contacting about a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// 0.0 - 1.0
    pub confidence: f32,
}

impl Contact {
    /// Has an email address and meets the confidence threshold.
    pub fn is_usable(&self, threshold: f32) -> bool {
        self.email.as_deref().is_some_and(|e| e.contains('@')) && self.confidence >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailDraft {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Durable property record as the CRM holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    pub id: PropertyRecordId,
    pub name: String,
    pub address: String,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub bfe: Option<String>,
    pub staged_property_id: Option<StagedPropertyId>,

    pub outreach_status: OutreachStatus,

    // Accumulated research
    pub owner_company: Option<String>,
    pub owner_cvr: Option<String>,
    pub contacts: Vec<Contact>,
    pub research_summary: Option<String>,
    pub outdoor_score: Option<u8>,
    pub data_quality: Option<DataQuality>,
    pub email_draft: Option<EmailDraft>,
    pub last_researched_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyIdentity for PropertyRecord {
    fn address(&self) -> &str {
        &self.address
    }

    fn bfe(&self) -> Option<&str> {
        self.bfe.as_deref()
    }
}

/// Input for [`CrmStore::create`]. New records start at `NY_KRAEVER_RESEARCH`.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewPropertyRecord {
    pub name: String,
    pub address: String,
    #[builder(default, setter(strip_option))]
    pub postal_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub city: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bfe: Option<String>,
    #[builder(default, setter(strip_option))]
    pub outdoor_score: Option<u8>,
    #[builder(default, setter(strip_option))]
    pub staged_property_id: Option<StagedPropertyId>,
}

/// Narrow update contract. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyRecordUpdate {
    pub outreach_status: Option<OutreachStatus>,
    pub owner_company: Option<String>,
    pub owner_cvr: Option<String>,
    pub contacts: Option<Vec<Contact>>,
    pub research_summary: Option<String>,
    pub outdoor_score: Option<u8>,
    pub data_quality: Option<DataQuality>,
    pub email_draft: Option<EmailDraft>,
    pub last_researched_at: Option<DateTime<Utc>>,
}

impl PropertyRecordUpdate {
    pub fn status(status: OutreachStatus) -> Self {
        Self {
            outreach_status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct CrmFilter {
    pub outreach_status: Option<OutreachStatus>,
    pub city: Option<String>,
    pub search: Option<String>,
    /// Records created from this staged property
    pub staged_property_id: Option<StagedPropertyId>,
    pub limit: Option<usize>,
}

impl CrmFilter {
    pub fn matches(&self, record: &PropertyRecord) -> bool {
        if self
            .outreach_status
            .is_some_and(|s| s != record.outreach_status)
        {
            return false;
        }
        if self
            .staged_property_id
            .is_some_and(|id| record.staged_property_id != Some(id))
        {
            return false;
        }
        if let Some(city) = &self.city {
            if !record
                .city
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(city.trim()))
            {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.trim().to_lowercase();
            let hit = [
                Some(record.name.as_str()),
                Some(record.address.as_str()),
                record.owner_company.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|h| h.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Record store exposed by the CRM.
#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn create(&self, record: NewPropertyRecord) -> CrmResult<PropertyRecord>;

    async fn get(&self, id: &PropertyRecordId) -> CrmResult<PropertyRecord>;

    async fn update(
        &self,
        id: &PropertyRecordId,
        update: PropertyRecordUpdate,
    ) -> CrmResult<PropertyRecord>;

    async fn list(&self, filter: &CrmFilter) -> CrmResult<Vec<PropertyRecord>>;
}
