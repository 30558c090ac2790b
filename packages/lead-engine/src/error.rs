//! Typed errors for the lead engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`). Each concern gets its
//! own enum so callers can match on exactly the failures an operation can
//! produce.

use thiserror::Error;

use crate::common::{MessageId, PropertyRecordId, StagedPropertyId};
use crate::identity::CanonicalKey;
use crate::outreach::{OutreachEvent, OutreachStatus};
use crate::staging::Stage;

/// Errors from the staging store.
#[derive(Debug, Error)]
pub enum StagingError {
    /// Bad input, never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another active staged property already holds this canonical key
    #[error("conflict: {key} is already staged as {existing}")]
    Conflict {
        key: CanonicalKey,
        existing: StagedPropertyId,
    },

    #[error("staged property not found: {0}")]
    NotFound(StagedPropertyId),

    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// Backing store failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failure signal from an external collaborator (registries, search, LLM, CRM, mail).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    /// Network or upstream hiccup, worth retrying
    #[error("transient failure from {source_name}: {message}")]
    Transient {
        source_name: String,
        message: String,
    },

    #[error("{source_name} has no record for {query}")]
    NotFound { source_name: String, query: String },

    /// Upstream rejected the request; retrying will not help
    #[error("permanent failure from {source_name}: {message}")]
    Permanent {
        source_name: String,
        message: String,
    },

    /// Upstream answered with something outside its contract
    #[error("invalid response from {source_name}: {message}")]
    InvalidResponse {
        source_name: String,
        message: String,
    },
}

impl CollaboratorError {
    pub fn transient(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn permanent(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn not_found(source_name: impl Into<String>, query: impl Into<String>) -> Self {
        Self::NotFound {
            source_name: source_name.into(),
            query: query.into(),
        }
    }

    pub fn invalid_response(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors at the CRM boundary.
#[derive(Debug, Error)]
pub enum CrmError {
    #[error("property record not found: {0}")]
    NotFound(PropertyRecordId),

    /// A field in the CRM payload could not be translated
    #[error("field {field}: {reason}")]
    Field { field: String, reason: String },

    #[error("CRM unavailable: {0}")]
    Unavailable(#[from] CollaboratorError),
}

/// Errors from pushing an approved staged property to the CRM.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    #[error("Push already in progress for staged property {0}")]
    InProgress(StagedPropertyId),
}

/// Rejected outreach status transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("outreach status {from} does not accept {event:?}")]
pub struct OutreachTransitionError {
    pub from: OutreachStatus,
    pub event: OutreachEvent,
}

/// Errors from the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A run for this property is still in `running` state
    #[error("a research run is already running for property {0}")]
    AlreadyRunning(PropertyRecordId),

    #[error("no research run registered for property {0}")]
    NotRegistered(PropertyRecordId),

    #[error(transparent)]
    InvalidTransition(#[from] OutreachTransitionError),

    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),
}

/// Errors from the outbound dispatch queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("message not found: {0}")]
    NotFound(MessageId),
}

/// Result type alias for staging operations.
pub type StagingResult<T> = std::result::Result<T, StagingError>;

/// Result type alias for collaborator calls.
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Result type alias for CRM operations.
pub type CrmResult<T> = std::result::Result<T, CrmError>;

/// Result type alias for CRM pushes.
pub type PushResult<T> = std::result::Result<T, PushError>;

/// Result type alias for workflow operations.
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
