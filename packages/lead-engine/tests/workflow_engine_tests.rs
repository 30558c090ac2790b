//! Integration tests for research runs over CRM records:
//! - Per-property mutual exclusion
//! - Mandatory vs optional step failures
//! - Outreach status changes driven by runs and by operators

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use crate::common::*;
use lead_engine::crm::CrmStore;
use lead_engine::error::CollaboratorResult;
use lead_engine::workflow::{ContextDelta, ResearchContext, ResearchStep};
use lead_engine::testing::{
    MockCompanyRegistry, MockEmailDrafter, MockPropertyRegistry, MockResearchAnalyst,
    MockWebsiteFetcher,
};
use lead_engine::workflow::steps::{EMAIL_DRAFT, LLM_ANALYSIS, WEBSITE_SCRAPE};
use lead_engine::{
    CollaboratorError, DataQuality, OutreachStatus, RunStatus, StepStatus, WorkflowEngine,
    WorkflowError,
};
use test_context::test_context;
use tokio::sync::Notify;

/// Every source answers: owner with CVR, company with website, a contact page.
fn full_mocks() -> MockCollaborators {
    MockCollaborators {
        property_registry: Arc::new(MockPropertyRegistry::new().with_owner(owner())),
        company_registry: Arc::new(MockCompanyRegistry::new().with_company(company())),
        website_fetcher: Arc::new(MockWebsiteFetcher::new().with_page(OWNER_SITE, owner_site_html())),
        analyst: Arc::new(MockResearchAnalyst::new().with_analysis(analysis_with_contact())),
        ..Default::default()
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn successful_run_writes_research_back_to_crm(ctx: &TestHarness) {
    let mocks = full_mocks();
    let engine = ctx.workflow_engine(&mocks);
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert!(run.error.is_none());
    assert!(run.ready_for_review);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));

    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.outreach_status, OutreachStatus::ResearchDoneContactPending);
    assert_eq!(stored.owner_company.as_deref(), Some("Algade Ejendomme ApS"));
    assert_eq!(stored.owner_cvr.as_deref(), Some(OWNER_CVR));
    assert_eq!(stored.contacts.len(), 1);
    assert_eq!(stored.outdoor_score, Some(8));
    assert_eq!(stored.data_quality, Some(DataQuality::High));
    assert_eq!(
        stored.email_draft.map(|d| d.recipient),
        Some("mette@algade-ejendomme.dk".to_string())
    );
    assert!(stored.last_researched_at.is_some());

    // The analyst saw what the earlier steps gathered
    let seen = &mocks.analyst.calls()[0];
    assert_eq!(seen.owner.as_ref().map(|o| o.owner_name.as_str()), Some("Algade Ejendomme ApS"));
    assert_eq!(
        seen.website.as_ref().map(|w| w.emails.clone()),
        Some(vec!["mette@algade-ejendomme.dk".to_string()])
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn second_run_for_same_property_is_refused_while_running(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.start_run(&record.id, "Algade 1").await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));

    let err = engine.start_run(&record.id, "Algade 1").await.unwrap_err();
    assert!(matches!(err, WorkflowError::AlreadyRunning(_)));

    let finished = engine.execute(run).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(!engine.is_running(&record.id));

    let next = engine.start_run(&record.id, "Algade 1").await;
    assert!(next.is_ok());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn runs_for_different_properties_are_independent(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let a = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;
    let b = crm_record(&ctx.crm, "Algade 2", OutreachStatus::NyKraeverResearch).await;

    let (ra, rb) = tokio::join!(engine.run_research(&a.id), engine.run_research(&b.id));

    assert_eq!(ra.unwrap().status, RunStatus::Completed);
    assert_eq!(rb.unwrap().status, RunStatus::Completed);
    assert_eq!(engine.get_all_raw_research().await.len(), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn mandatory_step_failure_aborts_run_and_sets_fejl(ctx: &TestHarness) {
    let mocks = MockCollaborators {
        analyst: Arc::new(
            MockResearchAnalyst::new().with_error(CollaboratorError::permanent("llm", "quota exceeded")),
        ),
        ..full_mocks()
    };
    let engine = ctx.workflow_engine(&mocks);
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().is_some_and(|e| e.contains(LLM_ANALYSIS)));
    let llm = run.step(LLM_ANALYSIS).unwrap();
    assert_eq!(llm.status, StepStatus::Failed);
    assert!(llm.error.as_deref().is_some_and(|e| e.contains("quota exceeded")));
    assert_eq!(run.step(EMAIL_DRAFT).unwrap().status, StepStatus::Skipped);
    assert!(mocks.drafter.calls().is_empty());

    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.outreach_status, OutreachStatus::Fejl);
    assert!(!engine.is_running(&record.id));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn optional_scrape_failure_still_completes(ctx: &TestHarness) {
    let mocks = MockCollaborators {
        website_fetcher: Arc::new(
            MockWebsiteFetcher::new()
                .fail_url(OWNER_SITE, CollaboratorError::permanent("website", "HTTP 403")),
        ),
        ..full_mocks()
    };
    let engine = ctx.workflow_engine(&mocks);
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let scrape = run.step(WEBSITE_SCRAPE).unwrap();
    assert_eq!(scrape.status, StepStatus::Skipped);
    assert!(scrape.error.as_deref().is_some_and(|e| e.contains("HTTP 403")));
    assert_eq!(run.step(LLM_ANALYSIS).unwrap().status, StepStatus::Completed);

    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.outreach_status, OutreachStatus::ResearchDoneContactPending);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn missing_sources_cap_data_quality(ctx: &TestHarness) {
    // Only the analyst and drafter are wired; every lookup source is absent
    let mocks = MockCollaborators {
        analyst: Arc::new(MockResearchAnalyst::new().with_analysis(analysis_with_contact())),
        ..Default::default()
    };
    let engine = lead_engine::WorkflowEngine::new(
        ctx.crm.clone(),
        lead_engine::ResearchCollaborators::builder()
            .analyst(mocks.analyst.clone())
            .drafter(mocks.drafter.clone())
            .build(),
        ctx.workflow_config.clone(),
    );
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.data_quality, Some(DataQuality::Low));

    let research = engine.get_raw_research(&record.id).await.unwrap();
    assert_eq!(research.missing_sources(), 5);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn transient_llm_failures_are_retried(ctx: &TestHarness) {
    let mocks = MockCollaborators {
        analyst: Arc::new(
            MockResearchAnalyst::new()
                .with_analysis(analysis_with_contact())
                .with_failures(2, CollaboratorError::transient("llm", "rate limited")),
        ),
        ..full_mocks()
    };
    let engine = ctx.workflow_engine(&mocks);
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(mocks.analyst.calls().len(), 3);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn low_confidence_contact_is_not_ready_for_review(ctx: &TestHarness) {
    let mut analysis = analysis_with_contact();
    analysis.contacts = vec![contact("info@algade-ejendomme.dk", 0.4)];
    let mocks = MockCollaborators {
        analyst: Arc::new(MockResearchAnalyst::new().with_analysis(analysis)),
        drafter: Arc::new(MockEmailDrafter::new()),
        ..full_mocks()
    };
    let engine = ctx.workflow_engine(&mocks);
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let run = engine.run_research(&record.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.ready_for_review);
    assert!(mocks.drafter.calls().is_empty());
    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert!(stored.email_draft.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn closed_property_is_not_researched(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::LukketVundet).await;

    let err = engine.run_research(&record.id).await.unwrap_err();

    assert!(matches!(err, WorkflowError::InvalidTransition(_)));
    assert!(engine.get_recent_runs(10).await.is_empty());
}

// =============================================================================
// Operator actions and history
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn mark_ready_promotes_researched_property(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;
    engine.run_research(&record.id).await.unwrap();

    let ready = engine.mark_ready(&record.id).await.unwrap();

    assert_eq!(ready.outreach_status, OutreachStatus::KlarTilUdsendelse);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn mark_ready_refuses_closed_property(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::LukketTabt).await;

    let err = engine.mark_ready(&record.id).await.unwrap_err();

    assert!(matches!(err, WorkflowError::InvalidTransition(_)));
    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.outreach_status, OutreachStatus::LukketTabt);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn stale_run_is_swept_and_lock_released(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;
    let abandoned = engine.start_run(&record.id, "Algade 1").await.unwrap();

    assert!(engine.sweep_stale_runs(Utc::now()).await.is_empty());

    let swept = engine
        .sweep_stale_runs(Utc::now() + Duration::minutes(31))
        .await;

    assert_eq!(swept, vec![abandoned.run_id]);
    assert!(!engine.is_running(&record.id));
    let recent = engine.get_recent_runs(1).await;
    assert_eq!(recent[0].status, RunStatus::Failed);
    assert!(recent[0].steps.iter().all(|s| s.status == StepStatus::Skipped));

    let retry = engine.run_research(&record.id).await.unwrap();
    assert_eq!(retry.status, RunStatus::Completed);
}

/// Analysis step whose first call waits for `release` and then fails.
/// Later calls succeed at once.
struct HeldAnalysis {
    calls: AtomicU32,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ResearchStep for HeldAnalysis {
    fn id(&self) -> &'static str {
        LLM_ANALYSIS
    }

    fn name(&self) -> &'static str {
        "LLM analysis"
    }

    fn mandatory(&self) -> bool {
        true
    }

    async fn execute(&self, _context: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
            return Err(CollaboratorError::permanent("llm", "model unavailable"));
        }
        Ok(ContextDelta {
            analysis: Some(analysis_with_contact()),
            ..Default::default()
        })
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn swept_run_finishing_late_leaves_newer_results_alone(ctx: &TestHarness) {
    let step = Arc::new(HeldAnalysis {
        calls: AtomicU32::new(0),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = Arc::new(WorkflowEngine::with_steps(
        ctx.crm.clone(),
        vec![step.clone() as Arc<dyn ResearchStep>],
        ctx.workflow_config.clone(),
    ));
    let record = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;

    let stale = engine.start_run(&record.id, "Algade 1").await.unwrap();
    let stale_id = stale.run_id;
    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute(stale).await }
    });
    step.entered.notified().await;

    let swept = engine
        .sweep_stale_runs(Utc::now() + Duration::minutes(31))
        .await;
    assert_eq!(swept, vec![stale_id]);

    let fresh = engine.run_research(&record.id).await.unwrap();
    assert_eq!(fresh.status, RunStatus::Completed);

    step.release.notify_one();
    let late = handle.await.unwrap().unwrap();
    assert_eq!(late.status, RunStatus::Failed);
    assert!(late.error.as_deref().unwrap_or_default().contains("stale"));

    let stored = ctx.crm.get(&record.id).await.unwrap();
    assert_eq!(stored.outreach_status, OutreachStatus::ResearchDoneContactPending);
    let research = engine.get_raw_research(&record.id).await.unwrap();
    assert!(research.analysis.is_some());

    let recent = engine.get_recent_runs(2).await;
    assert_eq!(recent[0].run_id, fresh.run_id);
    assert_eq!(recent[1].run_id, stale_id);
    assert_eq!(recent[1].status, RunStatus::Failed);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn recent_runs_are_newest_first(ctx: &TestHarness) {
    let engine = ctx.workflow_engine(&full_mocks());
    let a = crm_record(&ctx.crm, "Algade 1", OutreachStatus::NyKraeverResearch).await;
    let b = crm_record(&ctx.crm, "Algade 2", OutreachStatus::NyKraeverResearch).await;

    engine.run_research(&a.id).await.unwrap();
    engine.run_research(&b.id).await.unwrap();

    let recent = engine.get_recent_runs(10).await;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].property_id, b.id);
    assert_eq!(recent[1].property_id, a.id);
    assert_eq!(engine.get_recent_runs(1).await.len(), 1);
}
