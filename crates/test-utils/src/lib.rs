pub mod builders;
pub mod fake_executor;

use std::sync::{Arc, Once};

use pipengine::config::{EngineConfig, RawEngineConfig};
use pipengine::coord::MemoryCoordinator;
use pipengine::definition::DefinitionCatalog;
use pipengine::engine::Engine;
use pipengine::store::MemoryStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use crate::fake_executor::FakeExecutor;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
///
/// Under `start_paused` the timeout is virtual time, so it only fires when
/// the engine is stuck with nothing left to advance.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Like [`with_timeout`] with a custom limit, for tests that sleep through
/// retry and loop backoff in paused time.
#[allow(dead_code)]
pub async fn with_timeout_secs<F, T>(secs: u64, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(secs), f)
        .await
        .unwrap_or_else(|_| panic!("Test timed out after {secs} seconds"))
}

/// Engine config with short poll, retry and redelivery intervals.
pub fn fast_config() -> EngineConfig {
    let mut raw = RawEngineConfig::default();
    raw.reconcile.wait_poll_secs = 1;
    raw.reconcile.redeliver_secs = 2;
    raw.retry.base_secs = 1;
    raw.retry.floor_secs = 1;
    raw.retry.ceiling_secs = 4;
    EngineConfig::try_from(raw).expect("fast config is valid")
}

/// An engine over in-memory collaborators and one fake executor.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub coord: Arc<MemoryCoordinator>,
    pub executor: Arc<FakeExecutor>,
    pub shutdown: CancellationToken,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(DefinitionCatalog::new(), fast_config())
    }

    pub fn with_catalog(catalog: DefinitionCatalog) -> Self {
        Self::with(catalog, fast_config())
    }

    pub fn with(catalog: DefinitionCatalog, config: EngineConfig) -> Self {
        let store = MemoryStore::new();
        let coord = MemoryCoordinator::new();
        let executor = FakeExecutor::new();
        let engine = Engine::builder(store.clone(), coord.clone())
            .executor(executor.clone())
            .catalog(catalog)
            .config(config)
            .build();
        Self {
            engine,
            store,
            coord,
            executor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the engine's wake loop.
    pub fn start(&self) -> &Self {
        self.engine.start(self.shutdown.clone());
        self
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
