//! Workflow engine: run registry, step sequencing and outreach updates.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::context::ResearchContext;
use super::steps::{default_steps, ResearchStep};
use super::{ResearchCollaborators, RunStatus, StepStatus, WorkflowRun, WorkflowStep};
use crate::common::{PropertyRecordId, WorkflowRunId};
use crate::config::WorkflowConfig;
use crate::crm::{CrmStore, PropertyRecord, PropertyRecordUpdate};
use crate::error::{WorkflowError, WorkflowResult};
use crate::outreach::{self, OutreachEvent};

/// Releases the property's run lock when the run finishes, however it ends.
struct RunGuard<'a> {
    active: &'a DashMap<PropertyRecordId, WorkflowRunId>,
    property_id: PropertyRecordId,
    run_id: WorkflowRunId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        // A sweep may already have released this run and let a new one in
        self.active
            .remove_if(&self.property_id, |_, current| *current == self.run_id);
    }
}

pub struct WorkflowEngine {
    crm: Arc<dyn CrmStore>,
    steps: Vec<Arc<dyn ResearchStep>>,
    config: WorkflowConfig,
    /// At most one running run per property
    active: DashMap<PropertyRecordId, WorkflowRunId>,
    /// Oldest first
    runs: RwLock<Vec<WorkflowRun>>,
    research: RwLock<HashMap<PropertyRecordId, ResearchContext>>,
}

impl WorkflowEngine {
    pub fn new(
        crm: Arc<dyn CrmStore>,
        collaborators: ResearchCollaborators,
        config: WorkflowConfig,
    ) -> Self {
        let steps = default_steps(&collaborators, &config);
        Self::with_steps(crm, steps, config)
    }

    /// Engine over a custom step sequence, executed in the given order.
    pub fn with_steps(
        crm: Arc<dyn CrmStore>,
        steps: Vec<Arc<dyn ResearchStep>>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            crm,
            steps,
            config,
            active: DashMap::new(),
            runs: RwLock::new(Vec::new()),
            research: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, property_id: &PropertyRecordId) -> bool {
        self.active.contains_key(property_id)
    }

    /// Register a new run with every step pending.
    ///
    /// Fails with `AlreadyRunning` while another run for the property is
    /// still running.
    pub async fn start_run(
        &self,
        property_id: &PropertyRecordId,
        property_name: impl Into<String>,
    ) -> WorkflowResult<WorkflowRun> {
        let run_id = WorkflowRunId::new();
        match self.active.entry(property_id.clone()) {
            Entry::Occupied(_) => return Err(WorkflowError::AlreadyRunning(property_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(run_id);
            }
        }

        let run = WorkflowRun {
            run_id,
            property_id: property_id.clone(),
            property_name: property_name.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            steps: self
                .steps
                .iter()
                .map(|s| WorkflowStep::pending(s.id(), s.name()))
                .collect(),
            error: None,
            ready_for_review: false,
        };
        self.runs.write().await.push(run.clone());

        info!(property_id = %property_id, run_id = %run_id, "Research run started");
        Ok(run)
    }

    /// Execute a started run to completion.
    ///
    /// Step failures never escape: the returned run carries the outcome.
    /// Errors only when the run is not the one registered for its property.
    pub async fn execute(&self, run: WorkflowRun) -> WorkflowResult<WorkflowRun> {
        if !self.holds_lock(&run) {
            return Err(WorkflowError::NotRegistered(run.property_id));
        }
        let _guard = RunGuard {
            active: &self.active,
            property_id: run.property_id.clone(),
            run_id: run.run_id,
        };
        let mut run = run;

        let record = match self.begin(&run.property_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(property_id = %run.property_id, error = %e, "Research could not start");
                run.abort(format!("could not start research: {}", e), Utc::now());
                self.store_run(&run).await;
                return Ok(run);
            }
        };

        let mut ctx = ResearchContext::new(&record);
        let mut abort_reason = None;

        // Strictly sequential: each step reads what the previous ones added
        for (step, entry) in self.steps.iter().zip(run.steps.iter_mut()) {
            entry.status = StepStatus::Running;
            entry.started_at = Some(Utc::now());

            let result = step.execute(&ctx).await;
            entry.completed_at = Some(Utc::now());

            match result {
                Ok(delta) => {
                    entry.details = delta.details.clone();
                    entry.status = StepStatus::Completed;
                    ctx.merge(delta);
                }
                Err(e) if step.mandatory() => {
                    warn!(
                        property_id = %run.property_id,
                        step = step.id(),
                        error = %e,
                        "Mandatory research step failed"
                    );
                    entry.status = StepStatus::Failed;
                    entry.error = Some(e.to_string());
                    abort_reason = Some(format!("step {} failed: {}", step.id(), e));
                    break;
                }
                Err(e) => {
                    warn!(
                        property_id = %run.property_id,
                        step = step.id(),
                        error = %e,
                        "Optional research step failed, continuing"
                    );
                    entry.status = StepStatus::Skipped;
                    entry.error = Some(e.to_string());
                }
            }
        }

        let now = Utc::now();
        if !self.holds_lock(&run) {
            // Swept while running; a newer run may own the property by now
            let reason = match abort_reason {
                Some(reason) => format!("released as stale before finishing: {}", reason),
                None => "released as stale before finishing".to_string(),
            };
            run.abort(reason, now);
            warn!(
                property_id = %run.property_id,
                run_id = %run.run_id,
                status = %run.status,
                "Stale research run finished after its lock was released; results discarded"
            );
            self.store_run(&run).await;
            return Ok(run);
        }

        match abort_reason {
            Some(reason) => {
                run.abort(reason, now);
                if let Err(e) =
                    outreach::apply_event(self.crm.as_ref(), &run.property_id, OutreachEvent::Failed)
                        .await
                {
                    warn!(property_id = %run.property_id, error = %e, "Could not set outreach status FEJL");
                    if let Some(error) = &mut run.error {
                        error.push_str(&format!("; could not set FEJL: {}", e));
                    }
                }
            }
            None => {
                self.cap_quality(&mut ctx);
                run.ready_for_review = self.has_ready_draft(&ctx);
                run.status = RunStatus::Completed;
                run.completed_at = Some(now);

                // Best effort: the research itself succeeded
                if let Err(e) = self.write_research(&run.property_id, &ctx).await {
                    warn!(property_id = %run.property_id, error = %e, "Could not write research to CRM");
                    run.error = Some(format!("research completed but CRM update failed: {}", e));
                }
            }
        }

        self.research
            .write()
            .await
            .insert(run.property_id.clone(), ctx);
        self.store_run(&run).await;

        info!(
            property_id = %run.property_id,
            run_id = %run.run_id,
            status = %run.status,
            ready_for_review = run.ready_for_review,
            "Research run finished"
        );
        Ok(run)
    }

    /// Load the CRM record, then start and execute a run for it.
    pub async fn run_research(&self, property_id: &PropertyRecordId) -> WorkflowResult<WorkflowRun> {
        let record = self.crm.get(property_id).await?;
        record.outreach_status.apply(OutreachEvent::ResearchStarted)?;

        let run = self.start_run(property_id, record.name.clone()).await?;
        self.execute(run).await
    }

    /// Operator promotion to `KLAR_TIL_UDSENDELSE`.
    pub async fn mark_ready(&self, property_id: &PropertyRecordId) -> WorkflowResult<PropertyRecord> {
        if self.is_running(property_id) {
            return Err(WorkflowError::AlreadyRunning(property_id.clone()));
        }
        let record =
            outreach::apply_event(self.crm.as_ref(), property_id, OutreachEvent::MarkedReady).await?;
        info!(property_id = %property_id, "Property marked ready for outreach");
        Ok(record)
    }

    /// Fail runs that have been running longer than the stale timeout and
    /// release their locks. Returns the ids of swept runs.
    pub async fn sweep_stale_runs(&self, now: DateTime<Utc>) -> Vec<WorkflowRunId> {
        let cutoff = now - self.config.stale_run_timeout;
        let mut swept = Vec::new();

        let mut runs = self.runs.write().await;
        for run in runs
            .iter_mut()
            .filter(|r| r.is_running() && r.started_at <= cutoff)
        {
            run.abort(
                format!(
                    "stale: still running after {} minutes",
                    self.config.stale_run_timeout.num_minutes()
                ),
                now,
            );
            self.active
                .remove_if(&run.property_id, |_, current| *current == run.run_id);
            warn!(property_id = %run.property_id, run_id = %run.run_id, "Stale research run failed");
            swept.push(run.run_id);
        }
        swept
    }

    /// Newest first.
    pub async fn get_recent_runs(&self, limit: usize) -> Vec<WorkflowRun> {
        self.runs
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Context of the latest finished run for the property.
    pub async fn get_raw_research(&self, property_id: &PropertyRecordId) -> Option<ResearchContext> {
        self.research.read().await.get(property_id).cloned()
    }

    pub async fn get_all_raw_research(&self) -> Vec<ResearchContext> {
        let mut all: Vec<_> = self.research.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.property_id.cmp(&b.property_id));
        all
    }

    async fn begin(&self, property_id: &PropertyRecordId) -> WorkflowResult<PropertyRecord> {
        let record = self.crm.get(property_id).await?;
        let next = record.outreach_status.apply(OutreachEvent::ResearchStarted)?;
        if next == record.outreach_status {
            return Ok(record);
        }
        Ok(self
            .crm
            .update(property_id, PropertyRecordUpdate::status(next))
            .await?)
    }

    fn holds_lock(&self, run: &WorkflowRun) -> bool {
        self.active
            .get(&run.property_id)
            .is_some_and(|current| *current.value() == run.run_id)
    }

    fn cap_quality(&self, ctx: &mut ResearchContext) {
        let ceiling = ctx.quality_ceiling();
        if let Some(analysis) = &mut ctx.analysis {
            analysis.data_quality = analysis.data_quality.min(ceiling);
        }
    }

    fn has_ready_draft(&self, ctx: &ResearchContext) -> bool {
        let threshold = self.config.contact_confidence_threshold;
        let usable = ctx
            .analysis
            .as_ref()
            .is_some_and(|a| a.contacts.iter().any(|c| c.is_usable(threshold)));
        usable && ctx.email_draft.is_some()
    }

    async fn write_research(
        &self,
        property_id: &PropertyRecordId,
        ctx: &ResearchContext,
    ) -> WorkflowResult<()> {
        let Some(analysis) = &ctx.analysis else {
            return Ok(());
        };
        let record = self.crm.get(property_id).await?;
        let next = record.outreach_status.apply(OutreachEvent::ResearchCompleted)?;

        let update = PropertyRecordUpdate {
            outreach_status: Some(next),
            owner_company: analysis
                .owner_company
                .clone()
                .or_else(|| ctx.company.as_ref().map(|c| c.name.clone())),
            owner_cvr: analysis
                .owner_cvr
                .clone()
                .or_else(|| ctx.company.as_ref().map(|c| c.cvr.clone())),
            contacts: Some(analysis.contacts.clone()),
            research_summary: Some(analysis.summary.clone()),
            outdoor_score: Some(analysis.outdoor_score),
            data_quality: Some(analysis.data_quality),
            email_draft: ctx.email_draft.clone(),
            last_researched_at: Some(Utc::now()),
        };
        self.crm.update(property_id, update).await?;
        Ok(())
    }

    async fn store_run(&self, run: &WorkflowRun) {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().rev().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
    }
}
