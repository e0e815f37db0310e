//! Host-facing entry point.
//!
//! A [`Sandbox`] ties the engine services, the current snapshot and an
//! instance pool together and exposes the operations an embedding host needs:
//! build or load a snapshot, run a check, run a script, dispose.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::SandboxError;
use crate::http::ReqwestClient;
use crate::instance::InstanceOptions;
use crate::platform::{self, Platform};
use crate::pool::{InstanceLease, InstancePool, SnapshotStore, new_pool};
use crate::services::SandboxServices;
use crate::snapshot::{PluginSource, Snapshot, SnapshotBuilder};
use crate::types::{CheckRequest, RequestContext, Verdicts};

pub struct Sandbox {
    config: EngineConfig,
    platform: Arc<Platform>,
    services: SandboxServices,
    snapshots: Arc<SnapshotStore>,
    pool: Box<dyn InstancePool>,
}

impl Sandbox {
    /// Initialize the engine services if needed and create an empty sandbox.
    ///
    /// Plugins reach the network through reqwest; use
    /// [`Sandbox::with_services`] to supply other collaborators.
    pub fn new(config: EngineConfig) -> Result<Self, SandboxError> {
        let services = SandboxServices::default()
            .with_http(Arc::new(ReqwestClient::new(config.http.clone())));
        Self::with_services(config, services)
    }

    /// Like [`Sandbox::new`] with caller-supplied services. A missing request
    /// dispatcher is filled in with the platform's.
    pub fn with_services(
        config: EngineConfig,
        mut services: SandboxServices,
    ) -> Result<Self, SandboxError> {
        let platform = platform::initialize(&config)?;
        if services.dispatcher.is_none() {
            services.dispatcher = Some(platform.request_dispatcher());
        }

        let snapshots = Arc::new(SnapshotStore::new());
        let options = InstanceOptions {
            platform: platform.clone(),
            services: services.clone(),
            limits: config.limits.clone(),
        };
        let pool = new_pool(&config.pool, snapshots.clone(), options);
        tracing::debug!("[Sandbox::new] Pool policy {:?}", pool.policy());

        Ok(Self {
            config,
            platform,
            services,
            snapshots,
            pool,
        })
    }

    /// A builder preconfigured with this sandbox's services and limits.
    pub fn snapshot_builder(&self) -> SnapshotBuilder {
        SnapshotBuilder::new(self.platform.clone())
            .services(self.services.clone())
            .load_timeout(self.config.limits.load_timeout())
    }

    /// Build a snapshot from `config` and `plugins` and install it.
    pub fn build_snapshot(
        &self,
        config: Option<&str>,
        plugins: Vec<PluginSource>,
        version: &str,
    ) -> Result<Arc<Snapshot>, SandboxError> {
        let mut builder = self.snapshot_builder().plugins(plugins).version(version);
        if let Some(config) = config {
            builder = builder.config(config);
        }
        self.install_snapshot(builder.build()?)
    }

    /// Install `snapshot`; pooled instances built from older ones expire.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>, SandboxError> {
        self.snapshots.install(snapshot)
    }

    /// Load a saved snapshot, stamp it with the current time and install it.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<Arc<Snapshot>, SandboxError> {
        let snapshot = Snapshot::load(path, Platform::current_clock_millis())?;
        self.install_snapshot(snapshot)
    }

    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshots.current()
    }

    /// An instance from the pool. May block while one is built.
    pub fn acquire(&self) -> Result<InstanceLease, SandboxError> {
        self.pool.acquire()
    }

    pub fn check(&self, request: CheckRequest) -> Result<Verdicts, SandboxError> {
        self.acquire()?.check(request)
    }

    pub async fn check_async(&self, request: CheckRequest) -> Result<Verdicts, SandboxError> {
        let lease = self.acquire()?;
        lease.check_async(request).await
    }

    /// JSON in, JSON out: `None` when no plugin produced a verdict.
    ///
    /// A `timeout_ms` of 0 uses the configured check timeout.
    pub fn check_json(
        &self,
        check_point: &str,
        params: &str,
        context: Option<Arc<RequestContext>>,
        timeout_ms: u64,
    ) -> Result<Option<String>, SandboxError> {
        let mut request = CheckRequest::from_json(check_point, params);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        if timeout_ms > 0 {
            request = request.with_timeout(Duration::from_millis(timeout_ms));
        }
        Ok(self.check(request)?.to_json())
    }

    pub fn exec_script(&self, source: &str, filename: &str) -> Result<serde_json::Value, SandboxError> {
        self.acquire()?.exec_script(source, filename)
    }

    pub fn pool(&self) -> &dyn InstancePool {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Close every pooled instance. The engine services stay up for other
    /// sandboxes; see [`crate::shutdown`].
    pub fn dispose(self) {
        self.pool.clear();
        tracing::debug!("[Sandbox::dispose] Pool cleared");
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("policy", &self.pool.policy())
            .field("instances", &self.pool.len())
            .field("snapshot", &self.snapshots.current())
            .field("services", &self.services)
            .finish()
    }
}
