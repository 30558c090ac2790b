//! Property Lead Engine
//!
//! Finds commercial properties with outdoor advertising potential, stages
//! them for human review, researches their owners and drives outreach.
//!
//! # Flow
//!
//! ```text
//! permit feeds ──> discovery ──> staging ──(approve)──> CRM record
//!                                                          │
//!                      dispatch queue <── outreach <── research workflow
//! ```
//!
//! Every boundary to the outside world is a trait (permit sources, research
//! collaborators, the CRM, the mail transport) so the engine runs the same
//! against in-memory stores and mocks as against real services.
//!
//! # Modules
//!
//! - [`identity`] - Address normalization and canonical property keys
//! - [`staging`] - Staged property lifecycle and stores
//! - [`discovery`] - Permit-driven candidate discovery and scoring
//! - [`crm`] - CRM property records and the field-level boundary
//! - [`workflow`] - Research runs over CRM records
//! - [`outreach`] - Outreach status machine
//! - [`dispatch`] - Rate-limited outbound mail queue
//! - [`testing`] - Mock implementations for testing

pub mod common;
pub mod config;
pub mod crm;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod outreach;
pub mod staging;
pub mod testing;
pub mod workflow;

// Re-export core types at crate root
pub use common::{Id, MessageId, PropertyRecordId, StagedPropertyId, WorkflowRunId};
pub use config::{Config, DiscoveryConfig, DispatchConfig, WorkflowConfig};
pub use crm::{
    Contact, CrmFilter, CrmStore, DataQuality, EmailDraft, MemoryCrmStore, NewPropertyRecord,
    PropertyRecord, PropertyRecordUpdate,
};
pub use discovery::{
    CandidateRecord, CandidateScorer, DiscoveryArea, DiscoveryPipeline, DiscoveryReport, LlmScore,
    PermitSource, RawPermit,
};
pub use dispatch::{
    Clock, Delivery, DispatchQueue, DispatchStats, DrainReport, MailTransport, ManualClock,
    MessageKind, MessageStatus, OutboundMessage, QueuedMessage, SystemClock, TransportError,
};
pub use error::{
    CollaboratorError, CrmError, DispatchError, OutreachTransitionError, PushError, StagingError,
    WorkflowError,
};
pub use identity::{canonical_key, deduplicate, normalize_address, same_property, CanonicalKey};
pub use outreach::{OutreachEvent, OutreachStatus, PipelineOverview};
pub use staging::{
    bulk_reject, push_to_crm, MemoryStagingStore, NewStagedProperty, PropertySource, Stage,
    StagedProperty, StagedPropertyPatch, StagingFilter, StagingStore,
};
pub use workflow::{
    ResearchCollaborators, ResearchContext, RunStatus, StepStatus, WorkflowEngine, WorkflowRun,
    WorkflowStep,
};
