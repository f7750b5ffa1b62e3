use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use quillforge::checkpoint::CheckpointStore;
use quillforge::external::GenerationContext;
use quillforge::sim::{InMemoryLedger, RecordingSink, SimulatedGenerator};
use quillforge::{
    ClientIdentity, Collaborators, GenerationError, GenerationRequest, Generator, Orchestrator,
    OrchestratorConfig,
};

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .with_idle_poll(Duration::from_millis(10))
        .with_attempt_timeout(Duration::from_secs(5))
}

pub fn chapter(user: &str, tier: &str, stages: u32) -> GenerationRequest {
    GenerationRequest::new(ClientIdentity::new(format!("{user}-app"), user, tier), "novel/outline")
        .with_stages(stages)
        .with_target_words(2_000)
}

pub struct Setup {
    pub generator: Arc<dyn Generator>,
    pub ledger: Arc<InMemoryLedger>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<CheckpointStore>,
}

impl Setup {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            ledger: Arc::new(InMemoryLedger::new().with_default_budget(100_000)),
            sink: Arc::new(RecordingSink::new()),
            store: Arc::new(CheckpointStore::in_memory()),
        }
    }

    pub fn simulated(generator: SimulatedGenerator) -> (Self, Arc<SimulatedGenerator>) {
        let generator = Arc::new(generator);
        (Self::new(generator.clone()), generator)
    }

    pub fn with_ledger(mut self, ledger: InMemoryLedger) -> Self {
        self.ledger = Arc::new(ledger);
        self
    }

    pub fn with_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn start(&self, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::start(
            config,
            Collaborators {
                generator: self.generator.clone(),
                ledger: self.ledger.clone(),
                sink: self.sink.clone(),
                store: self.store.clone(),
            },
        )
        .expect("orchestrator starts")
    }
}

/// Wraps the simulated generator and stalls once at `stage`, long enough to
/// trip the attempt timeout.
pub struct StallOnce {
    pub inner: SimulatedGenerator,
    pub stage: u32,
    pub stall: Duration,
    stalled: AtomicBool,
}

impl StallOnce {
    pub fn new(stage: u32, stall: Duration) -> Self {
        Self {
            inner: SimulatedGenerator::new(),
            stage,
            stall,
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Generator for StallOnce {
    async fn generate(&self, context: &GenerationContext) -> Result<String, GenerationError> {
        if context.stage == self.stage && !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.generate(context).await
    }
}
