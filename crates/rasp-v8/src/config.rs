//! Engine configuration.
//!
//! Values are layered with figment: compiled defaults, then an optional TOML
//! file, then `RASP_`-prefixed environment variables (`__` separates nested
//! keys, e.g. `RASP_LIMITS__CHECK_TIMEOUT_MS=200`).

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Top-level configuration for the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub platform: PlatformConfig,
    pub dispatcher: DispatcherConfig,
    pub pool: PoolConfig,
    pub limits: LimitsConfig,
    pub http: HttpConfig,
}

/// Engine-wide background services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Background threads for the V8 platform and the watchdog pool.
    pub worker_threads: usize,
    /// Extra V8 flags, e.g. `--stack-size=900`.
    pub v8_flags: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            v8_flags: Vec::new(),
        }
    }
}

/// Dispatcher for fire-and-forget plugin requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            queue_capacity: 100,
        }
    }
}

/// How runtime instances are handed out to calling threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// One cached instance per calling thread.
    #[default]
    PerThread,
    /// A capped set of instances shared by all threads.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub policy: PoolPolicy,
    /// Live instance cap for the shared policy.
    pub max_instances: usize,
    /// Outstanding leases after which a shared instance counts as saturated.
    pub max_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            policy: PoolPolicy::PerThread,
            max_instances: 4,
            max_concurrency: 5,
        }
    }
}

/// Time, heap and stack limits applied to every instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub check_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub load_timeout_ms: u64,
    /// Heap usage sampled after a GC above which the instance is killed.
    pub heap_ceiling_mb: usize,
    /// Hard V8 heap limit.
    pub heap_limit_mb: usize,
    pub thread_stack_size_kb: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 100,
            exec_timeout_ms: 5000,
            load_timeout_ms: 5000,
            heap_ceiling_mb: 512,
            heap_limit_mb: 640,
            thread_stack_size_kb: 8192,
        }
    }
}

impl LimitsConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn heap_ceiling_bytes(&self) -> usize {
        self.heap_ceiling_mb * 1024 * 1024
    }

    pub fn heap_limit_bytes(&self) -> usize {
        self.heap_limit_mb * 1024 * 1024
    }
}

/// Outbound HTTP used by `RASP.request` and `RASP.request_async`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_redirects: 5,
            accept_invalid_certs: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SandboxError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment.merge(Env::prefixed("RASP_").split("__")).extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string layered over the defaults.
    pub fn from_toml(source: &str) -> Result<Self, SandboxError> {
        let config = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string(source))
            .extract()?;
        Ok(config)
    }
}
