//! Engine services provider.
//!
//! Process-wide owner of V8 initialization and of the background threads the
//! rest of the crate relies on: the worker pool watchdogs run on, and the
//! bounded dispatcher that carries fire-and-forget plugin requests.

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use deno_core::{JsRuntime, v8};
use parking_lot::{Mutex, RwLock};

use crate::config::{EngineConfig, PlatformConfig};
use crate::dispatcher::Dispatcher;
use crate::error::SandboxError;

/// Environment variable holding extra, whitespace separated V8 flags.
pub const V8_OPTIONS_ENV: &str = "RASP_V8_OPTIONS";

static V8_INIT: Once = Once::new();

static CURRENT: RwLock<Option<Arc<Platform>>> = parking_lot::const_rwlock(None);

/// Serializes isolate creation across threads.
///
/// Creating several isolates at once from different threads has been seen to
/// crash inside V8, so every `JsRuntime` construction takes this lock.
pub(crate) static ISOLATE_CREATE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Background facilities shared by every instance.
pub struct Platform {
    started: Instant,
    workers: Dispatcher,
    requests: Arc<Dispatcher>,
}

/// Initialize V8 and start the engine services. Idempotent.
///
/// After [`shutdown`] a new provider is started on the next call; V8 itself is
/// only ever initialized once per process.
pub fn initialize(config: &EngineConfig) -> Result<Arc<Platform>, SandboxError> {
    let mut current = CURRENT.write();
    if let Some(platform) = current.as_ref() {
        return Ok(platform.clone());
    }

    init_v8(&config.platform);
    let platform = Arc::new(Platform::start(config)?);
    *current = Some(platform.clone());

    tracing::info!(
        "Engine services started: {} worker threads, request pool {}x{}",
        config.platform.worker_threads,
        config.dispatcher.pool_size,
        config.dispatcher.queue_capacity
    );
    Ok(platform)
}

/// The running provider, if [`initialize`] has been called.
pub fn current() -> Option<Arc<Platform>> {
    CURRENT.read().clone()
}

/// Stop the engine services and join their threads.
///
/// Instances that still hold the provider keep working, but their watchdogs
/// fall back to dedicated threads and `request_async` is rejected.
pub fn shutdown() {
    let platform = CURRENT.write().take();
    if let Some(platform) = platform {
        platform.stop();
        tracing::info!("Engine services stopped");
    }
}

fn init_v8(config: &PlatformConfig) {
    V8_INIT.call_once(|| {
        // The first entry stands in for argv[0].
        let mut flags = vec![String::from("rasp")];
        flags.extend(config.v8_flags.iter().cloned());
        if let Ok(extra) = std::env::var(V8_OPTIONS_ENV) {
            flags.extend(extra.split_whitespace().map(str::to_string));
        }
        if flags.len() > 1 {
            tracing::debug!("[init_v8] Setting flags {:?}", &flags[1..]);
            for flag in deno_core::v8_set_flags(flags).iter().skip(1) {
                tracing::warn!("Unrecognized V8 flag: {}", flag);
            }
        }

        let threads = u32::try_from(config.worker_threads.max(1)).unwrap_or(u32::MAX);
        let v8_platform = v8::new_default_platform(threads, false).make_shared();
        JsRuntime::init_platform(Some(v8_platform), false);
    });
}

impl Platform {
    fn start(config: &EngineConfig) -> Result<Self, SandboxError> {
        let workers = Dispatcher::new(
            "rasp-worker",
            config.platform.worker_threads.max(1),
            config.platform.worker_threads.max(1),
        )?;
        let requests = Arc::new(Dispatcher::new(
            "rasp-request",
            config.dispatcher.pool_size,
            config.dispatcher.queue_capacity,
        )?);

        Ok(Self {
            started: Instant::now(),
            workers,
            requests,
        })
    }

    fn stop(&self) {
        self.requests.terminate();
        self.workers.terminate();
    }

    /// Run `task` on a background worker.
    ///
    /// Tasks that would have to wait for a busy worker get a thread of their
    /// own instead, so a blocking task never delays another.
    pub fn call_on_worker_thread<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(task) = self.workers.post_to_idle(task) {
            let spawned = thread::Builder::new()
                .name("rasp-worker-overflow".into())
                .spawn(task);
            if let Err(e) = spawned {
                tracing::error!("Failed to spawn overflow worker: {}", e);
            }
        }
    }

    /// Dispatcher used by `RASP.request_async`.
    pub fn request_dispatcher(&self) -> Arc<Dispatcher> {
        self.requests.clone()
    }

    /// Time since the provider started.
    pub fn monotonic_time(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock milliseconds since the Unix epoch.
    pub fn current_clock_millis() -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
    }
}
