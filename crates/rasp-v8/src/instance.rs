//! Runtime instance handle.
//!
//! An [`Instance`] is one V8 isolate built from a [`Snapshot`]. The isolate
//! lives on a dedicated thread; the handle is `Send + Sync` and forwards
//! every operation over a command channel, so any thread may use it while
//! execution itself stays on one thread.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use deno_core::v8;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::command::{InstanceCommand, Reply};
use crate::config::LimitsConfig;
use crate::error::SandboxError;
use crate::platform::Platform;
use crate::services::SandboxServices;
use crate::snapshot::Snapshot;
use crate::types::{CheckRequest, Verdicts};
use crate::watchdog::InstanceFlags;
use crate::worker::InstanceWorker;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Everything an instance needs besides its snapshot.
#[derive(Clone)]
pub struct InstanceOptions {
    pub platform: Arc<Platform>,
    pub services: SandboxServices,
    pub limits: LimitsConfig,
}

/// Heap figures reported by V8, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapUsage {
    pub used_heap_size: usize,
    pub total_heap_size: usize,
    pub heap_size_limit: usize,
}

/// Handle to a runtime instance.
pub struct Instance {
    id: u64,
    /// Command sender
    cmd_tx: mpsc::UnboundedSender<InstanceCommand>,
    /// Whether the instance has been shut down
    terminated: Arc<AtomicBool>,
    /// V8 isolate handle for forced termination
    isolate_handle: v8::IsolateHandle,
    flags: Arc<InstanceFlags>,
    snapshot_timestamp: u64,
    created_at: u64,
    check_points: BTreeSet<String>,
    default_timeout: Duration,
    /// Outstanding pool leases
    in_flight: AtomicUsize,
    /// Thread join handle
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Instance {
    /// Build an instance from `snapshot` and wait until it is initialized.
    ///
    /// `timestamp` is the wall-clock creation time, kept for diagnostics;
    /// expiry is decided by the snapshot's own timestamp.
    pub fn new(
        snapshot: Arc<Snapshot>,
        timestamp: u64,
        options: InstanceOptions,
    ) -> Result<Self, SandboxError> {
        if !snapshot.is_ok() {
            return Err(SandboxError::InvalidSnapshot);
        }

        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("rasp-instance-{}", id);
        tracing::debug!("[Instance::new] Starting {}", name);

        let flags = Arc::new(InstanceFlags::default());
        let terminated = Arc::new(AtomicBool::new(false));
        let snapshot_timestamp = snapshot.timestamp();
        let default_timeout = options.limits.check_timeout();
        let stack_size = options.limits.thread_stack_size_kb * 1024;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);

        let worker_flags = flags.clone();
        let worker_terminated = terminated.clone();
        let worker_name = name.clone();
        let thread_handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || {
                let worker = match InstanceWorker::create(snapshot, options, worker_flags) {
                    Ok((worker, init)) => {
                        if init_tx.send(Ok(init)).is_err() {
                            return;
                        }
                        worker
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                worker.run(&worker_name, cmd_rx, worker_terminated);
            })
            .map_err(SandboxError::SpawnFailed)?;

        let init = match init_rx.recv() {
            Ok(Ok(init)) => init,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                return Err(match thread_handle.join() {
                    Err(_) => SandboxError::ThreadPanic,
                    Ok(()) => SandboxError::ChannelClosed,
                });
            }
        };

        tracing::debug!(
            "[Instance::new] {} is ready ({} check points)",
            name,
            init.check_points.len()
        );
        Ok(Self {
            id,
            cmd_tx,
            terminated,
            isolate_handle: init.isolate_handle,
            flags,
            snapshot_timestamp,
            created_at: timestamp,
            check_points: init.check_points,
            default_timeout,
            in_flight: AtomicUsize::new(0),
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    fn send<T>(
        &self,
        make_cmd: impl FnOnce(Reply<T>) -> InstanceCommand,
    ) -> Result<oneshot::Receiver<Result<T, SandboxError>>, SandboxError> {
        if self.is_dead() {
            return Err(SandboxError::Terminated);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .map_err(|_| SandboxError::ChannelClosed)?;
        Ok(reply_rx)
    }

    /// Send a command and block the calling thread for the reply.
    ///
    /// Must not be called from inside an async runtime; use the `_async`
    /// variants there.
    fn call<T>(&self, make_cmd: impl FnOnce(Reply<T>) -> InstanceCommand) -> Result<T, SandboxError> {
        self.send(make_cmd)?
            .blocking_recv()
            .map_err(|_| SandboxError::ChannelClosed)?
    }

    async fn call_async<T>(
        &self,
        make_cmd: impl FnOnce(Reply<T>) -> InstanceCommand,
    ) -> Result<T, SandboxError> {
        self.send(make_cmd)?
            .await
            .map_err(|_| SandboxError::ChannelClosed)?
    }

    fn with_default_timeout(&self, mut request: CheckRequest) -> CheckRequest {
        if request.timeout.is_none() {
            request.timeout = Some(self.default_timeout);
        }
        request
    }

    /// Run the plugins registered for `request.check_point`.
    ///
    /// Plugin failures come back as `exception` verdicts, never as `Err`.
    pub fn check(&self, request: CheckRequest) -> Result<Verdicts, SandboxError> {
        let request = self.with_default_timeout(request);
        self.call(|reply| InstanceCommand::Check { request, reply })
    }

    pub async fn check_async(&self, request: CheckRequest) -> Result<Verdicts, SandboxError> {
        let request = self.with_default_timeout(request);
        self.call_async(|reply| InstanceCommand::Check { request, reply })
            .await
    }

    /// Run `source` and return its completion value as JSON.
    pub fn exec_script(&self, source: &str, filename: &str) -> Result<serde_json::Value, SandboxError> {
        let source = source.to_string();
        let filename = filename.to_string();
        self.call(|reply| InstanceCommand::ExecScript {
            source,
            filename,
            reply,
        })
    }

    pub async fn exec_script_async(
        &self,
        source: &str,
        filename: &str,
    ) -> Result<serde_json::Value, SandboxError> {
        let source = source.to_string();
        let filename = filename.to_string();
        self.call_async(|reply| InstanceCommand::ExecScript {
            source,
            filename,
            reply,
        })
        .await
    }

    /// Write `message` through the plugin console.
    pub fn log(&self, message: &str) -> Result<(), SandboxError> {
        let message = message.to_string();
        self.call(|reply| InstanceCommand::Log { message, reply })
    }

    pub fn heap_statistics(&self) -> Result<HeapUsage, SandboxError> {
        self.call(|reply| InstanceCommand::HeapStatistics { reply })
    }

    /// Whether a snapshot stamped `timestamp` supersedes this instance's.
    pub fn is_expired(&self, timestamp: u64) -> bool {
        timestamp > self.snapshot_timestamp
    }

    /// Shut down, out of memory, or its worker thread is gone.
    pub fn is_dead(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
            || self.flags.out_of_memory()
            || self.cmd_tx.is_closed()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn snapshot_timestamp(&self) -> u64 {
        self.snapshot_timestamp
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Hook names plugins may register for.
    pub fn check_points(&self) -> &BTreeSet<String> {
        &self.check_points
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn lease(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unlease(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stop the worker without waiting for it. Idempotent.
    ///
    /// The isolate is torn down on its own thread once the current command,
    /// if any, has been aborted.
    pub fn close(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(InstanceCommand::Shutdown);
        self.isolate_handle.terminate_execution();
    }

    /// Shut down and wait for the worker thread to finish.
    pub fn dispose(self) -> Result<(), SandboxError> {
        self.close();
        if let Some(handle) = self.thread_handle.lock().take() {
            handle.join().map_err(|_| SandboxError::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.close();
        // Wait for the thread to finish to ensure clean V8 shutdown
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("snapshot_timestamp", &self.snapshot_timestamp)
            .field("created_at", &self.created_at)
            .field("dead", &self.is_dead())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
