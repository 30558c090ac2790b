//! Test harness for integration testing.
//!
//! Every test gets fresh in-memory stores and mock collaborators, so tests
//! never share state and need no external services.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lead_engine::config::{DiscoveryConfig, DispatchConfig, WorkflowConfig};
use lead_engine::testing::{
    MockBuildingRegistry, MockCompanyRegistry, MockEmailDrafter, MockMailTransport,
    MockPropertyRegistry, MockResearchAnalyst, MockWebSearcher, MockWebsiteFetcher,
};
use lead_engine::{
    DiscoveryPipeline, DispatchQueue, ManualClock, MemoryCrmStore, MemoryStagingStore,
    ResearchCollaborators, WorkflowEngine,
};
use test_context::AsyncTestContext;

/// Initialize tracing once, respecting RUST_LOG.
///
/// Run tests with: RUST_LOG=debug cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Research collaborators, each a mock the test can configure or inspect.
#[derive(Clone)]
pub struct MockCollaborators {
    pub property_registry: Arc<MockPropertyRegistry>,
    pub building_registry: Arc<MockBuildingRegistry>,
    pub company_registry: Arc<MockCompanyRegistry>,
    pub web_searcher: Arc<MockWebSearcher>,
    pub website_fetcher: Arc<MockWebsiteFetcher>,
    pub analyst: Arc<MockResearchAnalyst>,
    pub drafter: Arc<MockEmailDrafter>,
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self {
            property_registry: Arc::new(MockPropertyRegistry::new()),
            building_registry: Arc::new(MockBuildingRegistry::new()),
            company_registry: Arc::new(MockCompanyRegistry::new()),
            web_searcher: Arc::new(MockWebSearcher::new()),
            website_fetcher: Arc::new(MockWebsiteFetcher::new()),
            analyst: Arc::new(MockResearchAnalyst::new()),
            drafter: Arc::new(MockEmailDrafter::new()),
        }
    }
}

impl MockCollaborators {
    pub fn research_collaborators(&self) -> ResearchCollaborators {
        ResearchCollaborators::builder()
            .property_registry(self.property_registry.clone())
            .building_registry(self.building_registry.clone())
            .company_registry(self.company_registry.clone())
            .web_searcher(self.web_searcher.clone())
            .website_fetcher(self.website_fetcher.clone())
            .analyst(self.analyst.clone())
            .drafter(self.drafter.clone())
            .build()
    }
}

/// Test harness that wires the engine together over in-memory stores.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let engine = ctx.workflow_engine(MockCollaborators::default());
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    pub staging: Arc<MemoryStagingStore>,
    pub crm: Arc<MemoryCrmStore>,
    pub clock: Arc<ManualClock>,
    pub workflow_config: WorkflowConfig,
    pub discovery_config: DiscoveryConfig,
    pub dispatch_config: DispatchConfig,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
    }

    async fn teardown(self) {
        // Stores are dropped with the harness
    }
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();

        Self {
            staging: Arc::new(MemoryStagingStore::new()),
            crm: Arc::new(MemoryCrmStore::new()),
            clock: Arc::new(ManualClock::new(Utc::now())),
            // No real waiting between retries in tests
            workflow_config: WorkflowConfig::builder()
                .retry_backoff(Duration::ZERO)
                .build(),
            discovery_config: DiscoveryConfig::default(),
            dispatch_config: DispatchConfig::default(),
        }
    }

    pub fn workflow_engine(&self, mocks: &MockCollaborators) -> WorkflowEngine {
        WorkflowEngine::new(
            self.crm.clone(),
            mocks.research_collaborators(),
            self.workflow_config.clone(),
        )
    }

    pub fn discovery_pipeline(&self) -> DiscoveryPipeline {
        DiscoveryPipeline::new(self.staging.clone(), self.discovery_config.clone())
    }

    pub fn dispatch_queue(&self, transport: Arc<MockMailTransport>) -> DispatchQueue {
        DispatchQueue::new(transport, &self.dispatch_config).with_clock(self.clock.clone())
    }
}
