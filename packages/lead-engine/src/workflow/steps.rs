//! Declared research steps.
//!
//! Each step reads the accumulated context and returns a delta. A step
//! that consults several sources fails only when none of them produced
//! anything and at least one failed; a source with no record or no
//! configuration just degrades the context.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::collaborators::{
    BuildingRegistry, CompanyQuery, CompanyRegistry, EmailDrafter, PropertyRegistry,
    ResearchAnalyst, ResearchCollaborators, WebSearcher, WebsiteFetcher,
};
use super::context::{ContextDelta, DataSource, ResearchContext, SourceStatus};
use crate::config::WorkflowConfig;
use crate::crm::Contact;
use crate::error::{CollaboratorError, CollaboratorResult};

pub const IDENTITY_LOOKUP: &str = "identity_lookup";
pub const COMPANY_SEARCH: &str = "company_search";
pub const WEBSITE_SCRAPE: &str = "website_scrape";
pub const LLM_ANALYSIS: &str = "llm_analysis";
pub const EMAIL_DRAFT: &str = "email_draft";

/// One entry in the ordered research sequence.
#[async_trait]
pub trait ResearchStep: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    /// A mandatory step's failure aborts the run.
    fn mandatory(&self) -> bool;

    async fn execute(&self, context: &ResearchContext) -> CollaboratorResult<ContextDelta>;
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Multiplied by the attempt number
    pub backoff: Duration,
}

impl From<&WorkflowConfig> for RetryPolicy {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_attempts: config.step_max_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }
}

/// Call `op` until it succeeds, fails non-transiently, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, source: &str, mut op: F) -> CollaboratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CollaboratorResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(source, attempt, error = %e, "Transient collaborator failure, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Collects per-source outcomes for one step.
#[derive(Default)]
struct Outcomes {
    delta: ContextDelta,
    errors: Vec<CollaboratorError>,
}

impl Outcomes {
    fn record<T>(&mut self, source: DataSource, result: CollaboratorResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.delta.source(source, SourceStatus::Available);
                Some(value)
            }
            Err(e) if e.is_not_found() => {
                self.delta
                    .source(source, SourceStatus::Unavailable(e.to_string()));
                None
            }
            Err(e) => {
                self.delta.source(source, SourceStatus::Failed(e.to_string()));
                self.errors.push(e);
                None
            }
        }
    }

    fn unavailable(&mut self, source: DataSource, reason: &str) {
        self.delta
            .source(source, SourceStatus::Unavailable(reason.to_string()));
    }

    fn finish(mut self, details: Vec<String>) -> CollaboratorResult<ContextDelta> {
        if !self.delta.any_available() && !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        let mut details = details;
        details.extend(self.delta.failures());
        if !details.is_empty() {
            self.delta.details = Some(details.join("; "));
        }
        Ok(self.delta)
    }
}

const NOT_CONFIGURED: &str = "not configured";

// ============================================================================
// Steps
// ============================================================================

/// Owner (OIS), building (BBR) and, when the owner has a CVR number, the
/// company profile.
pub struct IdentityLookupStep {
    property_registry: Option<Arc<dyn PropertyRegistry>>,
    building_registry: Option<Arc<dyn BuildingRegistry>>,
    company_registry: Option<Arc<dyn CompanyRegistry>>,
    retry: RetryPolicy,
}

#[async_trait]
impl ResearchStep for IdentityLookupStep {
    fn id(&self) -> &'static str {
        IDENTITY_LOOKUP
    }

    fn name(&self) -> &'static str {
        "Identity lookup (OIS/BBR/CVR)"
    }

    fn mandatory(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        let mut out = Outcomes::default();
        let mut details = Vec::new();
        let address = ctx.address.as_str();

        match &self.property_registry {
            Some(registry) => {
                let result = with_retry(self.retry, "ois", || registry.lookup(address)).await;
                if let Some(owner) = out.record(DataSource::PropertyRegistry, result) {
                    details.push(format!("owner: {}", owner.owner_name));
                    out.delta.owner = Some(owner);
                }
            }
            None => out.unavailable(DataSource::PropertyRegistry, NOT_CONFIGURED),
        }

        match &self.building_registry {
            Some(registry) => {
                let result = with_retry(self.retry, "bbr", || registry.lookup(address)).await;
                if let Some(building) = out.record(DataSource::BuildingRegistry, result) {
                    if let Some(usage) = &building.usage {
                        details.push(format!("usage: {}", usage));
                    }
                    out.delta.building = Some(building);
                }
            }
            None => out.unavailable(DataSource::BuildingRegistry, NOT_CONFIGURED),
        }

        let cvr = out.delta.owner.as_ref().and_then(|o| o.owner_cvr.clone());
        match (&self.company_registry, cvr) {
            (Some(registry), Some(cvr)) => {
                let query = CompanyQuery::Cvr(cvr);
                let result = with_retry(self.retry, "cvr", || registry.lookup(&query)).await;
                if let Some(company) = out.record(DataSource::CompanyRegistry, result) {
                    details.push(format!("company: {} ({})", company.name, company.cvr));
                    out.delta.company = Some(company);
                }
            }
            (Some(_), None) => out.unavailable(DataSource::CompanyRegistry, "owner has no CVR number"),
            (None, _) => out.unavailable(DataSource::CompanyRegistry, NOT_CONFIGURED),
        }

        out.finish(details)
    }
}

/// Company lookup by owner name when the CVR number was unknown, plus a
/// web search for the owner.
pub struct CompanySearchStep {
    company_registry: Option<Arc<dyn CompanyRegistry>>,
    web_searcher: Option<Arc<dyn WebSearcher>>,
    retry: RetryPolicy,
}

#[async_trait]
impl ResearchStep for CompanySearchStep {
    fn id(&self) -> &'static str {
        COMPANY_SEARCH
    }

    fn name(&self) -> &'static str {
        "Company and web search"
    }

    fn mandatory(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        let mut out = Outcomes::default();
        let mut details = Vec::new();

        if ctx.company.is_none() {
            match (&self.company_registry, &ctx.owner) {
                (Some(registry), Some(owner)) => {
                    let query = CompanyQuery::Name(owner.owner_name.clone());
                    let result = with_retry(self.retry, "cvr", || registry.lookup(&query)).await;
                    if let Some(company) = out.record(DataSource::CompanyRegistry, result) {
                        details.push(format!("company: {} ({})", company.name, company.cvr));
                        out.delta.company = Some(company);
                    }
                }
                (Some(_), None) => {
                    out.unavailable(DataSource::CompanyRegistry, "owner unknown")
                }
                (None, _) => out.unavailable(DataSource::CompanyRegistry, NOT_CONFIGURED),
            }
        }

        match &self.web_searcher {
            Some(searcher) => {
                let query = match &ctx.owner {
                    Some(owner) => format!("{} kontakt", owner.owner_name),
                    None => format!("{} ejendom", ctx.address),
                };
                let result = with_retry(self.retry, "web_search", || searcher.search(&query)).await;
                if let Some(hits) = out.record(DataSource::WebSearch, result) {
                    details.push(format!("{} search hits", hits.len()));
                    out.delta.search_hits = hits;
                }
            }
            None => out.unavailable(DataSource::WebSearch, NOT_CONFIGURED),
        }

        out.finish(details)
    }
}

/// Fetch the owner's website and pull contact details from it.
pub struct WebsiteScrapeStep {
    website_fetcher: Option<Arc<dyn WebsiteFetcher>>,
    retry: RetryPolicy,
}

#[async_trait]
impl ResearchStep for WebsiteScrapeStep {
    fn id(&self) -> &'static str {
        WEBSITE_SCRAPE
    }

    fn name(&self) -> &'static str {
        "Website scrape"
    }

    fn mandatory(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        let mut out = Outcomes::default();
        let mut details = Vec::new();

        let url = ctx
            .company
            .as_ref()
            .and_then(|c| c.website.clone())
            .or_else(|| ctx.search_hits.first().map(|h| h.url.clone()));

        match (&self.website_fetcher, url) {
            (Some(fetcher), Some(url)) => {
                let result = with_retry(self.retry, "website", || fetcher.fetch_content(&url)).await;
                if let Some(content) = out.record(DataSource::Website, result) {
                    details.push(format!(
                        "{}: {} emails, {} phones",
                        content.url,
                        content.emails.len(),
                        content.phones.len()
                    ));
                    out.delta.website = Some(content);
                }
            }
            (Some(_), None) => out.unavailable(DataSource::Website, "no website found"),
            (None, _) => out.unavailable(DataSource::Website, NOT_CONFIGURED),
        }

        out.finish(details)
    }
}

/// LLM analysis of everything gathered so far.
pub struct LlmAnalysisStep {
    analyst: Arc<dyn ResearchAnalyst>,
    retry: RetryPolicy,
}

#[async_trait]
impl ResearchStep for LlmAnalysisStep {
    fn id(&self) -> &'static str {
        LLM_ANALYSIS
    }

    fn name(&self) -> &'static str {
        "LLM analysis"
    }

    fn mandatory(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        let mut analysis = with_retry(self.retry, "llm", || self.analyst.analyze(ctx)).await?;

        if !(1..=10).contains(&analysis.outdoor_score) {
            return Err(CollaboratorError::invalid_response(
                "llm",
                format!("outdoor score {} outside 1-10", analysis.outdoor_score),
            ));
        }
        for contact in &mut analysis.contacts {
            contact.confidence = contact.confidence.clamp(0.0, 1.0);
        }

        let details = format!(
            "score {}, {} contacts, quality {:?}",
            analysis.outdoor_score,
            analysis.contacts.len(),
            analysis.data_quality
        );
        Ok(ContextDelta {
            analysis: Some(analysis),
            details: Some(details),
            ..Default::default()
        })
    }
}

/// Draft a first-contact email to the best usable contact.
pub struct EmailDraftStep {
    drafter: Arc<dyn EmailDrafter>,
    retry: RetryPolicy,
    contact_threshold: f32,
}

impl EmailDraftStep {
    fn best_contact<'a>(&self, ctx: &'a ResearchContext) -> Option<&'a Contact> {
        ctx.analysis
            .as_ref()?
            .contacts
            .iter()
            .filter(|c| c.is_usable(self.contact_threshold))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

#[async_trait]
impl ResearchStep for EmailDraftStep {
    fn id(&self) -> &'static str {
        EMAIL_DRAFT
    }

    fn name(&self) -> &'static str {
        "Email draft"
    }

    fn mandatory(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &ResearchContext) -> CollaboratorResult<ContextDelta> {
        let Some(contact) = self.best_contact(ctx) else {
            debug!(property_id = %ctx.property_id, "No usable contact, nothing to draft");
            return Ok(ContextDelta {
                details: Some("no usable contact".into()),
                ..Default::default()
            });
        };

        let draft = with_retry(self.retry, "email_drafter", || self.drafter.draft(ctx, contact)).await?;
        if draft.recipient.trim().is_empty() || draft.body.trim().is_empty() {
            return Err(CollaboratorError::invalid_response(
                "email_drafter",
                "draft without recipient or body",
            ));
        }

        Ok(ContextDelta {
            details: Some(format!("draft to {}", draft.recipient)),
            email_draft: Some(draft),
            ..Default::default()
        })
    }
}

/// The research sequence in execution order.
pub fn default_steps(
    collaborators: &ResearchCollaborators,
    config: &WorkflowConfig,
) -> Vec<Arc<dyn ResearchStep>> {
    let retry = RetryPolicy::from(config);
    vec![
        Arc::new(IdentityLookupStep {
            property_registry: collaborators.property_registry.clone(),
            building_registry: collaborators.building_registry.clone(),
            company_registry: collaborators.company_registry.clone(),
            retry,
        }),
        Arc::new(CompanySearchStep {
            company_registry: collaborators.company_registry.clone(),
            web_searcher: collaborators.web_searcher.clone(),
            retry,
        }),
        Arc::new(WebsiteScrapeStep {
            website_fetcher: collaborators.website_fetcher.clone(),
            retry,
        }),
        Arc::new(LlmAnalysisStep {
            analyst: collaborators.analyst.clone(),
            retry,
        }),
        Arc::new(EmailDraftStep {
            drafter: collaborators.drafter.clone(),
            retry,
            contact_threshold: config.contact_confidence_threshold,
        }),
    ]
}
