//! Research workflow for CRM property records.
//!
//! A run executes the declared research steps for one property in order,
//! threading a [`ResearchContext`] through them. Optional step failures
//! degrade the context; a mandatory step failure aborts the run and moves
//! the property to `FEJL`.

pub mod collaborators;
pub mod contacts;
pub mod context;
pub mod engine;
pub mod steps;

pub use collaborators::{
    BuildingInfo, BuildingRegistry, CompanyProfile, CompanyQuery, CompanyRegistry, EmailDrafter,
    OwnerInfo, PropertyRegistry, ResearchAnalysis, ResearchAnalyst, ResearchCollaborators,
    SearchHit, WebSearcher, WebsiteFetcher,
};
pub use contacts::WebsiteContent;
pub use context::{ContextDelta, DataSource, ResearchContext, SourceStatus};
pub use engine::WorkflowEngine;
pub use steps::{default_steps, with_retry, ResearchStep, RetryPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{PropertyRecordId, WorkflowRunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One step of a run, as shown on dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Kept on skipped optional steps too
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStep {
    fn pending(step_id: &str, step_name: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            details: None,
            error: None,
        }
    }
}

/// One execution of the research workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: WorkflowRunId,
    pub property_id: PropertyRecordId,
    pub property_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub steps: Vec<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A usable contact and an email draft exist; awaiting human promotion
    #[serde(default)]
    pub ready_for_review: bool,
}

impl WorkflowRun {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Fail the run, skipping every step that never finished.
    fn abort(&mut self, error: String, now: DateTime<Utc>) {
        for step in &mut self.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.status = StepStatus::Skipped;
            }
        }
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
    }
}
