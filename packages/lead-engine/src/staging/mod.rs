//! Staging area for discovered properties awaiting review.
//!
//! A staged property moves through an explicit stage lifecycle:
//!
//! ```text
//! new ──> researching ──> researched ──> approved ──> pushed
//!  │           │               │
//!  └───────────┴───────────────┴──────> rejected
//! ```
//!
//! `rejected` and `pushed` are terminal. Only one non-rejected staged
//! property may hold a given canonical key at a time.

pub mod bulk;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod push;

pub use bulk::{bulk_reject, BulkRejectReport};
pub use memory::MemoryStagingStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStagingStore;
pub use push::push_to_crm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use typed_builder::TypedBuilder;

use crate::common::{PropertyRecordId, StagedPropertyId};
use crate::error::{StagingError, StagingResult};
use crate::identity::{normalize_address, PropertyIdentity};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    Researching,
    Researched,
    Approved,
    Rejected,
    Pushed,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::New,
        Stage::Researching,
        Stage::Researched,
        Stage::Approved,
        Stage::Rejected,
        Stage::Pushed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Researching => "researching",
            Stage::Researched => "researched",
            Stage::Approved => "approved",
            Stage::Rejected => "rejected",
            Stage::Pushed => "pushed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Rejected | Stage::Pushed)
    }

    /// The allowed stage graph. Anything not listed is rejected.
    pub fn can_transition_to(&self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::New, Stage::Researching)
                | (Stage::New, Stage::Rejected)
                | (Stage::Researching, Stage::Researched)
                | (Stage::Researching, Stage::Rejected)
                | (Stage::Researched, Stage::Approved)
                | (Stage::Researched, Stage::Rejected)
                | (Stage::Approved, Stage::Pushed)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| StagingError::Validation(format!("invalid stage: {}", s)))
    }
}

/// Where a staged property came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySource {
    StreetDiscovery,
    Scaffolding,
    Manual,
}

impl PropertySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertySource::StreetDiscovery => "street_discovery",
            PropertySource::Scaffolding => "scaffolding",
            PropertySource::Manual => "manual",
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertySource {
    type Err = StagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "street_discovery" => Ok(PropertySource::StreetDiscovery),
            "scaffolding" => Ok(PropertySource::Scaffolding),
            "manual" => Ok(PropertySource::Manual),
            _ => Err(StagingError::Validation(format!("invalid source: {}", s))),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A discovered property awaiting or undergoing review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedProperty {
    pub id: StagedPropertyId,

    // Identity
    pub address: String,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub bfe: Option<String>,

    // Discovery metadata
    pub source: PropertySource,
    pub outdoor_score: Option<u8>,
    pub score_reason: Option<String>,
    pub traffic_estimate: Option<u32>,
    pub traffic_source: Option<String>,
    pub notes: Option<String>,

    pub stage: Stage,
    /// Set once the property has been pushed to the CRM
    pub crm_property_id: Option<PropertyRecordId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyIdentity for StagedProperty {
    fn address(&self) -> &str {
        &self.address
    }

    fn bfe(&self) -> Option<&str> {
        self.bfe.as_deref()
    }
}

/// Input for [`StagingStore::insert`].
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewStagedProperty {
    pub address: String,
    pub source: PropertySource,
    #[builder(default, setter(strip_option))]
    pub postal_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub city: Option<String>,
    #[builder(default, setter(strip_option))]
    pub bfe: Option<String>,
    #[builder(default, setter(strip_option))]
    pub outdoor_score: Option<u8>,
    #[builder(default, setter(strip_option))]
    pub score_reason: Option<String>,
    #[builder(default, setter(strip_option))]
    pub traffic_estimate: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub traffic_source: Option<String>,
    #[builder(default, setter(strip_option))]
    pub notes: Option<String>,
}

impl PropertyIdentity for NewStagedProperty {
    fn address(&self) -> &str {
        &self.address
    }

    fn bfe(&self) -> Option<&str> {
        self.bfe.as_deref()
    }
}

impl NewStagedProperty {
    /// Reject malformed input before it reaches the store.
    pub fn validate(&self) -> StagingResult<()> {
        if normalize_address(&self.address).is_empty() {
            return Err(StagingError::Validation("address is empty".into()));
        }
        validate_score(self.outdoor_score)
    }

    /// Materialize the record at stage `new`.
    pub fn into_staged(self, now: DateTime<Utc>) -> StagedProperty {
        StagedProperty {
            id: StagedPropertyId::new(),
            address: self.address.trim().to_string(),
            postal_code: self.postal_code,
            city: self.city,
            bfe: self.bfe.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()),
            source: self.source,
            outdoor_score: self.outdoor_score,
            score_reason: self.score_reason,
            traffic_estimate: self.traffic_estimate,
            traffic_source: self.traffic_source,
            notes: self.notes,
            stage: Stage::New,
            crm_property_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn validate_score(score: Option<u8>) -> StagingResult<()> {
    match score {
        Some(s) if !(1..=10).contains(&s) => Err(StagingError::Validation(format!(
            "outdoor score {} outside 1-10",
            s
        ))),
        _ => Ok(()),
    }
}

/// Partial update for [`StagingStore::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct StagedPropertyPatch {
    pub stage: Option<Stage>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub bfe: Option<String>,
    pub outdoor_score: Option<u8>,
    pub score_reason: Option<String>,
    pub traffic_estimate: Option<u32>,
    pub traffic_source: Option<String>,
    pub notes: Option<String>,
    pub crm_property_id: Option<PropertyRecordId>,
}

impl StagedPropertyPatch {
    /// A patch that only requests a stage transition.
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn touches_identity(&self) -> bool {
        self.address.is_some() || self.bfe.is_some()
    }

    fn touches_fields(&self) -> bool {
        self.touches_identity()
            || self.postal_code.is_some()
            || self.city.is_some()
            || self.outdoor_score.is_some()
            || self.score_reason.is_some()
            || self.traffic_estimate.is_some()
            || self.traffic_source.is_some()
            || self.notes.is_some()
            || self.crm_property_id.is_some()
    }
}

/// Apply a patch to a record, enforcing the stage graph.
///
/// Pushed records are frozen. Rejected records keep their stage but still
/// accept field corrections.
pub(crate) fn apply_patch(
    current: &StagedProperty,
    patch: StagedPropertyPatch,
    now: DateTime<Utc>,
) -> StagingResult<StagedProperty> {
    if let Some(next) = patch.stage {
        if !current.stage.can_transition_to(next) {
            return Err(StagingError::InvalidTransition {
                from: current.stage,
                to: next,
            });
        }
    }

    if current.stage == Stage::Pushed && patch.touches_fields() {
        return Err(StagingError::Validation(
            "pushed properties can no longer be edited".into(),
        ));
    }

    validate_score(patch.outdoor_score)?;

    let mut updated = current.clone();
    if let Some(address) = patch.address {
        if normalize_address(&address).is_empty() {
            return Err(StagingError::Validation("address is empty".into()));
        }
        updated.address = address.trim().to_string();
    }
    if let Some(bfe) = patch.bfe {
        let bfe = bfe.trim().to_string();
        updated.bfe = (!bfe.is_empty()).then_some(bfe);
    }
    if let Some(stage) = patch.stage {
        updated.stage = stage;
    }
    if patch.postal_code.is_some() {
        updated.postal_code = patch.postal_code;
    }
    if patch.city.is_some() {
        updated.city = patch.city;
    }
    if patch.outdoor_score.is_some() {
        updated.outdoor_score = patch.outdoor_score;
    }
    if patch.score_reason.is_some() {
        updated.score_reason = patch.score_reason;
    }
    if patch.traffic_estimate.is_some() {
        updated.traffic_estimate = patch.traffic_estimate;
    }
    if patch.traffic_source.is_some() {
        updated.traffic_source = patch.traffic_source;
    }
    if patch.notes.is_some() {
        updated.notes = patch.notes;
    }
    if patch.crm_property_id.is_some() {
        updated.crm_property_id = patch.crm_property_id;
    }
    updated.updated_at = now;

    Ok(updated)
}

// ============================================================================
// Queries
// ============================================================================

/// Filter for [`StagingStore::list`]. Empty filter lists everything.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct StagingFilter {
    pub stage: Option<Stage>,
    pub source: Option<PropertySource>,
    pub city: Option<String>,
    /// Case-insensitive substring over address, city and notes
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl StagingFilter {
    pub fn matches(&self, property: &StagedProperty) -> bool {
        if self.stage.is_some_and(|s| s != property.stage) {
            return false;
        }
        if self.source.is_some_and(|s| s != property.source) {
            return false;
        }
        if let Some(city) = &self.city {
            let matches_city = property
                .city
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(city.trim()));
            if !matches_city {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.trim().to_lowercase();
            let haystacks = [
                Some(property.address.as_str()),
                property.city.as_deref(),
                property.notes.as_deref(),
            ];
            let hit = haystacks
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

/// Number of staged properties per stage. Every stage is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCounts(BTreeMap<Stage, usize>);

impl Default for StageCounts {
    fn default() -> Self {
        Self(Stage::ALL.into_iter().map(|s| (s, 0)).collect())
    }
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> usize {
        self.0.get(&stage).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, stage: Stage) {
        *self.0.entry(stage).or_insert(0) += 1;
    }

    pub fn set(&mut self, stage: Stage, count: usize) {
        self.0.insert(stage, count);
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, usize)> + '_ {
        self.0.iter().map(|(s, c)| (*s, *c))
    }
}

// ============================================================================
// Store contract
// ============================================================================

/// Exclusive owner of staged properties.
///
/// All stage changes go through [`StagingStore::update`]; implementations must
/// run the canonical-key conflict check and the insert atomically.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert at stage `new`. Fails with `Conflict` if a non-rejected
    /// property already holds the candidate's canonical key.
    async fn insert(&self, candidate: NewStagedProperty) -> StagingResult<StagedProperty>;

    async fn get(&self, id: StagedPropertyId) -> StagingResult<StagedProperty>;

    /// Newest first.
    async fn list(&self, filter: &StagingFilter) -> StagingResult<Vec<StagedProperty>>;

    async fn update(
        &self,
        id: StagedPropertyId,
        patch: StagedPropertyPatch,
    ) -> StagingResult<StagedProperty>;

    /// Returns `false` when the id was unknown.
    async fn delete(&self, id: StagedPropertyId) -> StagingResult<bool>;

    async fn counts(&self) -> StagingResult<StageCounts>;

    /// Whether a non-rejected property has this normalized address.
    async fn exists_by_address(&self, address: &str) -> StagingResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(stage: Stage) -> StagedProperty {
        let mut p = NewStagedProperty::builder()
            .address("Algade 1")
            .source(PropertySource::Manual)
            .build()
            .into_staged(Utc::now());
        p.stage = stage;
        p
    }

    #[test]
    fn stage_graph_matches_lifecycle() {
        let path = [
            Stage::New,
            Stage::Researching,
            Stage::Researched,
            Stage::Approved,
            Stage::Pushed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }

        assert!(!Stage::Pushed.can_transition_to(Stage::New));
        assert!(!Stage::Rejected.can_transition_to(Stage::New));
        assert!(!Stage::Approved.can_transition_to(Stage::Rejected));
        assert!(!Stage::New.can_transition_to(Stage::Approved));
        assert!(!Stage::New.can_transition_to(Stage::New));
    }

    #[test]
    fn stage_parses_from_display() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert!("archived".parse::<Stage>().is_err());
    }

    #[test]
    fn patch_rejects_illegal_transition() {
        let err = apply_patch(
            &staged(Stage::Pushed),
            StagedPropertyPatch::stage(Stage::New),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StagingError::InvalidTransition {
                from: Stage::Pushed,
                to: Stage::New
            }
        ));
    }

    #[test]
    fn rejected_records_accept_corrections_but_pushed_do_not() {
        let patch = StagedPropertyPatch {
            notes: Some("wrong house number".into()),
            ..Default::default()
        };

        let fixed = apply_patch(&staged(Stage::Rejected), patch.clone(), Utc::now()).unwrap();
        assert_eq!(fixed.notes.as_deref(), Some("wrong house number"));
        assert_eq!(fixed.stage, Stage::Rejected);

        let err = apply_patch(&staged(Stage::Pushed), patch, Utc::now()).unwrap_err();
        assert!(matches!(err, StagingError::Validation(_)));
    }

    #[test]
    fn validate_rejects_blank_address_and_bad_score() {
        let blank = NewStagedProperty::builder()
            .address("  , Danmark")
            .source(PropertySource::Manual)
            .build();
        assert!(matches!(blank.validate(), Err(StagingError::Validation(_))));

        let bad_score = NewStagedProperty::builder()
            .address("Algade 1")
            .source(PropertySource::Manual)
            .outdoor_score(11u8)
            .build();
        assert!(matches!(bad_score.validate(), Err(StagingError::Validation(_))));
    }

    #[test]
    fn filter_matches_search_and_city() {
        let mut p = staged(Stage::New);
        p.city = Some("Roskilde".into());
        p.notes = Some("Corner building with scaffolding".into());

        assert!(StagingFilter::builder().city("roskilde").build().matches(&p));
        assert!(StagingFilter::builder().search("SCAFFOLD").build().matches(&p));
        assert!(!StagingFilter::builder().stage(Stage::Approved).build().matches(&p));
        assert!(!StagingFilter::builder().city("Odense").build().matches(&p));
    }

    #[test]
    fn counts_cover_every_stage() {
        let mut counts = StageCounts::default();
        counts.increment(Stage::New);
        counts.increment(Stage::New);
        assert_eq!(counts.get(Stage::New), 2);
        assert_eq!(counts.get(Stage::Pushed), 0);
        assert_eq!(counts.iter().count(), 6);
        assert_eq!(counts.total(), 2);
    }
}
