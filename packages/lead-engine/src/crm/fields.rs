//! Translation between typed property records and CRM field maps.
//!
//! The CRM speaks in loosely typed key/value objects. Field names below are
//! stable; dashboards and CRM automations depend on them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{NewPropertyRecord, PropertyRecord, PropertyRecordUpdate};
use crate::common::{PropertyRecordId, StagedPropertyId};
use crate::error::{CrmError, CrmResult};
use crate::outreach::OutreachStatus;

pub type FieldMap = Map<String, Value>;

pub const NAME: &str = "name";
pub const ADDRESS: &str = "address";
pub const POSTAL_CODE: &str = "postal_code";
pub const CITY: &str = "city";
pub const BFE: &str = "bfe";
pub const STAGED_PROPERTY_ID: &str = "staged_property_id";
pub const OUTREACH_STATUS: &str = "outreach_status";
pub const OWNER_COMPANY: &str = "owner_company";
pub const OWNER_CVR: &str = "owner_cvr";
pub const CONTACTS: &str = "contacts";
pub const RESEARCH_SUMMARY: &str = "research_summary";
pub const OUTDOOR_SCORE: &str = "outdoor_score";
pub const DATA_QUALITY: &str = "data_quality";
pub const EMAIL_DRAFT: &str = "email_draft";
pub const LAST_RESEARCHED_AT: &str = "last_researched_at";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

fn field_error(field: &str, reason: impl Into<String>) -> CrmError {
    CrmError::Field {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn opt_string(fields: &FieldMap, field: &str) -> CrmResult<Option<String>> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        // Some CRMs store numeric identifiers (BFE, CVR) as numbers
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(field_error(field, format!("expected string, got {}", other))),
    }
}

fn required_string(fields: &FieldMap, field: &str) -> CrmResult<String> {
    opt_string(fields, field)?.ok_or_else(|| field_error(field, "missing"))
}

fn opt_json<T: DeserializeOwned>(fields: &FieldMap, field: &str) -> CrmResult<Option<T>> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| field_error(field, e.to_string())),
    }
}

fn opt_score(fields: &FieldMap, field: &str) -> CrmResult<Option<u8>> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .filter(|v| (1..=10).contains(v))
            .map(Some)
            .ok_or_else(|| field_error(field, format!("score {} outside 1-10", n))),
        Some(other) => Err(field_error(field, format!("expected number, got {}", other))),
    }
}

fn opt_timestamp(fields: &FieldMap, field: &str) -> CrmResult<Option<DateTime<Utc>>> {
    opt_string(fields, field)?
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| field_error(field, e.to_string()))
        })
        .transpose()
}

fn put<T: Serialize>(fields: &mut FieldMap, field: &str, value: &T) {
    // Serializing plain data types into a Value cannot fail
    if let Ok(value) = serde_json::to_value(value) {
        fields.insert(field.to_string(), value);
    }
}

fn put_opt<T: Serialize>(fields: &mut FieldMap, field: &str, value: &Option<T>) {
    if let Some(value) = value {
        put(fields, field, value);
    }
}

impl PropertyRecord {
    /// Build a typed record from a CRM object. Unknown fields are ignored.
    pub fn from_fields(id: PropertyRecordId, fields: &FieldMap) -> CrmResult<Self> {
        let outreach_status = match opt_string(fields, OUTREACH_STATUS)? {
            Some(raw) => raw
                .parse::<OutreachStatus>()
                .map_err(|e| field_error(OUTREACH_STATUS, e))?,
            None => OutreachStatus::default(),
        };
        let staged_property_id = opt_string(fields, STAGED_PROPERTY_ID)?
            .map(|raw| {
                StagedPropertyId::parse(&raw).map_err(|e| field_error(STAGED_PROPERTY_ID, e.to_string()))
            })
            .transpose()?;
        let created_at = opt_timestamp(fields, CREATED_AT)?.unwrap_or_else(Utc::now);
        let updated_at = opt_timestamp(fields, UPDATED_AT)?.unwrap_or(created_at);

        let address = required_string(fields, ADDRESS)?;
        let name = opt_string(fields, NAME)?.unwrap_or_else(|| address.clone());

        Ok(Self {
            id,
            name,
            address,
            postal_code: opt_string(fields, POSTAL_CODE)?,
            city: opt_string(fields, CITY)?,
            bfe: opt_string(fields, BFE)?,
            staged_property_id,
            outreach_status,
            owner_company: opt_string(fields, OWNER_COMPANY)?,
            owner_cvr: opt_string(fields, OWNER_CVR)?,
            contacts: opt_json(fields, CONTACTS)?.unwrap_or_default(),
            research_summary: opt_string(fields, RESEARCH_SUMMARY)?,
            outdoor_score: opt_score(fields, OUTDOOR_SCORE)?,
            data_quality: opt_json(fields, DATA_QUALITY)?,
            email_draft: opt_json(fields, EMAIL_DRAFT)?,
            last_researched_at: opt_timestamp(fields, LAST_RESEARCHED_AT)?,
            created_at,
            updated_at,
        })
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        put(&mut fields, NAME, &self.name);
        put(&mut fields, ADDRESS, &self.address);
        put_opt(&mut fields, POSTAL_CODE, &self.postal_code);
        put_opt(&mut fields, CITY, &self.city);
        put_opt(&mut fields, BFE, &self.bfe);
        put_opt(&mut fields, STAGED_PROPERTY_ID, &self.staged_property_id);
        put(&mut fields, OUTREACH_STATUS, &self.outreach_status);
        put_opt(&mut fields, OWNER_COMPANY, &self.owner_company);
        put_opt(&mut fields, OWNER_CVR, &self.owner_cvr);
        put(&mut fields, CONTACTS, &self.contacts);
        put_opt(&mut fields, RESEARCH_SUMMARY, &self.research_summary);
        put_opt(&mut fields, OUTDOOR_SCORE, &self.outdoor_score);
        put_opt(&mut fields, DATA_QUALITY, &self.data_quality);
        put_opt(&mut fields, EMAIL_DRAFT, &self.email_draft);
        put_opt(&mut fields, LAST_RESEARCHED_AT, &self.last_researched_at);
        put(&mut fields, CREATED_AT, &self.created_at);
        put(&mut fields, UPDATED_AT, &self.updated_at);
        fields
    }
}

impl NewPropertyRecord {
    pub fn to_fields(&self, now: DateTime<Utc>) -> FieldMap {
        let mut fields = FieldMap::new();
        put(&mut fields, NAME, &self.name);
        put(&mut fields, ADDRESS, &self.address);
        put_opt(&mut fields, POSTAL_CODE, &self.postal_code);
        put_opt(&mut fields, CITY, &self.city);
        put_opt(&mut fields, BFE, &self.bfe);
        put_opt(&mut fields, OUTDOOR_SCORE, &self.outdoor_score);
        put_opt(&mut fields, STAGED_PROPERTY_ID, &self.staged_property_id);
        put(&mut fields, OUTREACH_STATUS, &OutreachStatus::NyKraeverResearch);
        put(&mut fields, CREATED_AT, &now);
        put(&mut fields, UPDATED_AT, &now);
        fields
    }
}

impl PropertyRecordUpdate {
    /// Only the fields being changed.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        put_opt(&mut fields, OUTREACH_STATUS, &self.outreach_status);
        put_opt(&mut fields, OWNER_COMPANY, &self.owner_company);
        put_opt(&mut fields, OWNER_CVR, &self.owner_cvr);
        put_opt(&mut fields, CONTACTS, &self.contacts);
        put_opt(&mut fields, RESEARCH_SUMMARY, &self.research_summary);
        put_opt(&mut fields, OUTDOOR_SCORE, &self.outdoor_score);
        put_opt(&mut fields, DATA_QUALITY, &self.data_quality);
        put_opt(&mut fields, EMAIL_DRAFT, &self.email_draft);
        put_opt(&mut fields, LAST_RESEARCHED_AT, &self.last_researched_at);
        fields
    }
}
