//! Shared identifier types.

pub mod id;

pub use id::Id;

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker for properties held in the staging area.
pub struct StagedPropertyEntity;

/// Marker for research workflow runs.
pub struct WorkflowRunEntity;

/// Marker for outbound messages.
pub struct MessageEntity;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

pub type StagedPropertyId = Id<StagedPropertyEntity>;

pub type WorkflowRunId = Id<WorkflowRunEntity>;

pub type MessageId = Id<MessageEntity>;

/// Identifier of a property record in the external CRM.
///
/// The CRM owns its id scheme, so this is an opaque string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyRecordId(String);

impl PropertyRecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyRecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PropertyRecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
