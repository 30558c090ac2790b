//! Testing utilities including mock implementations.
//!
//! These are useful for testing code that uses the lead engine without
//! calling real registries, LLMs, permit feeds or mail servers. Every mock
//! answers from a script: queued one-off results first, then a default.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::crm::{Contact, DataQuality, EmailDraft};
use crate::discovery::{CandidateRecord, CandidateScorer, DiscoveryArea, LlmScore, PermitSource, RawPermit};
use crate::dispatch::{MailTransport, QueuedMessage, TransportError};
use crate::error::{CollaboratorError, CollaboratorResult};
use crate::staging::PropertySource;
use crate::workflow::{
    BuildingInfo, BuildingRegistry, CompanyProfile, CompanyQuery, CompanyRegistry, EmailDrafter,
    OwnerInfo, PropertyRegistry, ResearchAnalysis, ResearchAnalyst, ResearchContext, SearchHit,
    WebSearcher, WebsiteFetcher,
};

/// Scripted answers: queued results are returned once each, then the default.
struct Script<T> {
    queue: VecDeque<CollaboratorResult<T>>,
    default: CollaboratorResult<T>,
}

impl<T: Clone> Script<T> {
    fn new(default: CollaboratorResult<T>) -> Self {
        Self {
            queue: VecDeque::new(),
            default,
        }
    }

    fn next(&mut self) -> CollaboratorResult<T> {
        self.queue
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

// ============================================================================
// Research collaborators
// ============================================================================

/// A mock property registry (OIS). Defaults to "no record".
pub struct MockPropertyRegistry {
    script: RwLock<Script<OwnerInfo>>,
    calls: RwLock<Vec<String>>,
}

impl Default for MockPropertyRegistry {
    fn default() -> Self {
        Self {
            script: RwLock::new(Script::new(Err(CollaboratorError::not_found("ois", "address")))),
            calls: RwLock::new(Vec::new()),
        }
    }
}

impl MockPropertyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(self, owner: OwnerInfo) -> Self {
        self.script.write().unwrap().default = Ok(owner);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    /// Fail the next `times` calls before falling back to the default.
    pub fn with_failures(self, times: usize, error: CollaboratorError) -> Self {
        let mut script = self.script.write().unwrap();
        script.queue.extend((0..times).map(|_| Err(error.clone())));
        drop(script);
        self
    }

    /// Addresses looked up, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl PropertyRegistry for MockPropertyRegistry {
    async fn lookup(&self, address: &str) -> CollaboratorResult<OwnerInfo> {
        self.calls.write().unwrap().push(address.to_string());
        self.script.write().unwrap().next()
    }
}

/// A mock building registry (BBR). Defaults to "no record".
pub struct MockBuildingRegistry {
    script: RwLock<Script<BuildingInfo>>,
    calls: RwLock<Vec<String>>,
}

impl Default for MockBuildingRegistry {
    fn default() -> Self {
        Self {
            script: RwLock::new(Script::new(Err(CollaboratorError::not_found("bbr", "address")))),
            calls: RwLock::new(Vec::new()),
        }
    }
}

impl MockBuildingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_building(self, building: BuildingInfo) -> Self {
        self.script.write().unwrap().default = Ok(building);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl BuildingRegistry for MockBuildingRegistry {
    async fn lookup(&self, address: &str) -> CollaboratorResult<BuildingInfo> {
        self.calls.write().unwrap().push(address.to_string());
        self.script.write().unwrap().next()
    }
}

/// A mock company registry (CVR) answering from a fixed set of companies.
#[derive(Default)]
pub struct MockCompanyRegistry {
    companies: RwLock<Vec<CompanyProfile>>,
    error: RwLock<Option<CollaboratorError>>,
    calls: RwLock<Vec<CompanyQuery>>,
}

impl MockCompanyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_company(self, company: CompanyProfile) -> Self {
        self.companies.write().unwrap().push(company);
        self
    }

    /// Every lookup fails with `error`.
    pub fn with_error(self, error: CollaboratorError) -> Self {
        *self.error.write().unwrap() = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<CompanyQuery> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl CompanyRegistry for MockCompanyRegistry {
    async fn lookup(&self, query: &CompanyQuery) -> CollaboratorResult<CompanyProfile> {
        self.calls.write().unwrap().push(query.clone());
        if let Some(error) = self.error.read().unwrap().clone() {
            return Err(error);
        }

        let companies = self.companies.read().unwrap();
        let found = companies.iter().find(|c| match query {
            CompanyQuery::Cvr(cvr) => &c.cvr == cvr,
            CompanyQuery::Name(name) => c.name.eq_ignore_ascii_case(name),
        });
        match (found, query) {
            (Some(company), _) => Ok(company.clone()),
            (None, CompanyQuery::Cvr(q) | CompanyQuery::Name(q)) => {
                Err(CollaboratorError::not_found("cvr", q.clone()))
            }
        }
    }
}

/// A mock web search returning the same hits for every query.
pub struct MockWebSearcher {
    script: RwLock<Script<Vec<SearchHit>>>,
    calls: RwLock<Vec<String>>,
}

impl Default for MockWebSearcher {
    fn default() -> Self {
        Self {
            script: RwLock::new(Script::new(Ok(Vec::new()))),
            calls: RwLock::new(Vec::new()),
        }
    }
}

impl MockWebSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(self, hits: Vec<SearchHit>) -> Self {
        self.script.write().unwrap().default = Ok(hits);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl WebSearcher for MockWebSearcher {
    async fn search(&self, query: &str) -> CollaboratorResult<Vec<SearchHit>> {
        self.calls.write().unwrap().push(query.to_string());
        self.script.write().unwrap().next()
    }
}

/// A mock website fetcher serving HTML by URL.
#[derive(Default)]
pub struct MockWebsiteFetcher {
    pages: RwLock<HashMap<String, String>>,
    failures: RwLock<HashMap<String, CollaboratorError>>,
    calls: RwLock<Vec<String>>,
}

impl MockWebsiteFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.write().unwrap().insert(url.into(), html.into());
        self
    }

    pub fn fail_url(self, url: impl Into<String>, error: CollaboratorError) -> Self {
        self.failures.write().unwrap().insert(url.into(), error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl WebsiteFetcher for MockWebsiteFetcher {
    async fn fetch(&self, url: &str) -> CollaboratorResult<String> {
        self.calls.write().unwrap().push(url.to_string());
        if let Some(error) = self.failures.read().unwrap().get(url) {
            return Err(error.clone());
        }
        self.pages
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CollaboratorError::not_found("website", url))
    }
}

/// A mock LLM analyst. Defaults to a medium-quality analysis without contacts.
pub struct MockResearchAnalyst {
    script: RwLock<Script<ResearchAnalysis>>,
    calls: RwLock<Vec<ResearchContext>>,
}

impl Default for MockResearchAnalyst {
    fn default() -> Self {
        Self {
            script: RwLock::new(Script::new(Ok(ResearchAnalysis {
                owner_company: None,
                owner_cvr: None,
                contacts: Vec::new(),
                outdoor_score: 6,
                summary: "Mock analysis".into(),
                data_quality: DataQuality::Medium,
            }))),
            calls: RwLock::new(Vec::new()),
        }
    }
}

impl MockResearchAnalyst {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis(self, analysis: ResearchAnalysis) -> Self {
        self.script.write().unwrap().default = Ok(analysis);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    pub fn with_failures(self, times: usize, error: CollaboratorError) -> Self {
        let mut script = self.script.write().unwrap();
        script.queue.extend((0..times).map(|_| Err(error.clone())));
        drop(script);
        self
    }

    /// Contexts the analyst was asked about, in call order.
    pub fn calls(&self) -> Vec<ResearchContext> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl ResearchAnalyst for MockResearchAnalyst {
    async fn analyze(&self, context: &ResearchContext) -> CollaboratorResult<ResearchAnalysis> {
        self.calls.write().unwrap().push(context.clone());
        self.script.write().unwrap().next()
    }
}

/// A mock email drafter writing a short draft to the given contact.
#[derive(Default)]
pub struct MockEmailDrafter {
    error: RwLock<Option<CollaboratorError>>,
    calls: RwLock<Vec<Contact>>,
}

impl MockEmailDrafter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        *self.error.write().unwrap() = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<Contact> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl EmailDrafter for MockEmailDrafter {
    async fn draft(
        &self,
        context: &ResearchContext,
        recipient: &Contact,
    ) -> CollaboratorResult<EmailDraft> {
        self.calls.write().unwrap().push(recipient.clone());
        if let Some(error) = self.error.read().unwrap().clone() {
            return Err(error);
        }
        Ok(EmailDraft {
            recipient: recipient.email.clone().unwrap_or_default(),
            subject: format!("Reklameplads på {}", context.address),
            body: format!("Hej {},\n\nVi har set stilladset på {}.", recipient.name, context.address),
        })
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// A mock permit source.
pub struct MockPermitSource {
    name: String,
    source: PropertySource,
    script: RwLock<Script<Vec<RawPermit>>>,
    calls: AtomicU32,
}

impl MockPermitSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: PropertySource::StreetDiscovery,
            script: RwLock::new(Script::new(Ok(Vec::new()))),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_source(mut self, source: PropertySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_permits(self, permits: Vec<RawPermit>) -> Self {
        self.script.write().unwrap().default = Ok(permits);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermitSource for MockPermitSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> PropertySource {
        self.source
    }

    async fn fetch(&self, _area: &DiscoveryArea) -> CollaboratorResult<Vec<RawPermit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.write().unwrap().next()
    }
}

/// A mock LLM candidate scorer. Unconfigured, it always fails.
pub struct MockCandidateScorer {
    script: RwLock<Script<LlmScore>>,
    calls: RwLock<Vec<String>>,
}

impl Default for MockCandidateScorer {
    fn default() -> Self {
        Self {
            script: RwLock::new(Script::new(Err(CollaboratorError::permanent(
                "mock_scorer",
                "no score configured",
            )))),
            calls: RwLock::new(Vec::new()),
        }
    }
}

impl MockCandidateScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(self, score: LlmScore) -> Self {
        self.script.write().unwrap().default = Ok(score);
        self
    }

    pub fn with_error(self, error: CollaboratorError) -> Self {
        self.script.write().unwrap().default = Err(error);
        self
    }

    /// Addresses scored, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl CandidateScorer for MockCandidateScorer {
    async fn score(&self, candidate: &CandidateRecord) -> CollaboratorResult<LlmScore> {
        self.calls
            .write()
            .unwrap()
            .push(candidate.permit.address.clone());
        self.script.write().unwrap().next()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// A mock mail transport recording every accepted message.
#[derive(Default)]
pub struct MockMailTransport {
    transient_failures: AtomicU32,
    permanent_failures: RwLock<HashSet<String>>,
    sent: RwLock<Vec<QueuedMessage>>,
    attempts: AtomicU32,
}

impl MockMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a transient error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Reject every message to `recipient` permanently.
    pub fn with_permanent_failure(self, recipient: impl Into<String>) -> Self {
        self.permanent_failures
            .write()
            .unwrap()
            .insert(recipient.into());
        self
    }

    pub fn sent(&self) -> Vec<QueuedMessage> {
        self.sent.read().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.permanent_failures.read().unwrap().contains(&message.recipient) {
            return Err(TransportError::Permanent(format!(
                "mailbox {} does not exist",
                message.recipient
            )));
        }

        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Transient("connection reset".into()));
        }

        self.sent.write().unwrap().push(message.clone());
        Ok(())
    }
}
