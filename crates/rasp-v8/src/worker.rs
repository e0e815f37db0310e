//! Worker side of a runtime instance.
//!
//! The worker owns the `JsRuntime` and runs on the instance's dedicated
//! thread. Commands are processed one at a time, which is what keeps checks
//! on one instance strictly serialized.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::{JsRuntime, RuntimeOptions, serde_v8, v8};
use tokio::sync::mpsc;

use crate::command::InstanceCommand;
use crate::config::LimitsConfig;
use crate::error::SandboxError;
use crate::exception::format_exception;
use crate::instance::{HeapUsage, InstanceOptions};
use crate::normalize::{normalize, terminated};
use crate::ops::rasp_sandbox;
use crate::platform::{ISOLATE_CREATE_LOCK, Platform};
use crate::script::{get_property, run_script, to_json};
use crate::snapshot::Snapshot;
use crate::types::{CheckRequest, OOM_MESSAGE, RequestContext, TIMEOUT_MESSAGE, Verdicts};
use crate::watchdog::{HeapGuard, InstanceFlags, WatchdogGuard};

/// What the spawning thread learns once the worker is ready.
pub(crate) struct WorkerInit {
    pub isolate_handle: v8::IsolateHandle,
    pub check_points: BTreeSet<String>,
}

/// Handles cached by `Initialize`.
struct CachedHandles {
    check_fn: v8::Global<v8::Function>,
    log_fn: v8::Global<v8::Function>,
    /// Last request context seen, by context id.
    context: Option<(u64, v8::Global<v8::Object>)>,
}

// Field order is drop order: cached handles go before the runtime, and the
// heap guard and snapshot bytes must outlive it.
pub(crate) struct InstanceWorker {
    handles: CachedHandles,
    runtime: JsRuntime,
    _heap_guard: Box<HeapGuard>,
    platform: Arc<Platform>,
    flags: Arc<InstanceFlags>,
    isolate: v8::IsolateHandle,
    limits: LimitsConfig,
    _snapshot: Arc<Snapshot>,
}

impl InstanceWorker {
    /// Create the runtime from `snapshot` and resolve the cached handles.
    pub(crate) fn create(
        snapshot: Arc<Snapshot>,
        options: InstanceOptions,
        flags: Arc<InstanceFlags>,
    ) -> Result<(Self, WorkerInit), SandboxError> {
        // SAFETY: the bytes live in `snapshot`, which this worker holds in its
        // last field, so they outlive the runtime built from them.
        let startup: &'static [u8] = unsafe { &*(snapshot.data() as *const [u8]) };

        let mut runtime = {
            let _lock = ISOLATE_CREATE_LOCK.lock();
            JsRuntime::new(RuntimeOptions {
                extensions: vec![rasp_sandbox::init_ops()],
                startup_snapshot: Some(startup),
                create_params: Some(
                    v8::CreateParams::default().heap_limits(0, options.limits.heap_limit_bytes()),
                ),
                ..Default::default()
            })
        };
        runtime.op_state().borrow_mut().put(options.services.clone());

        let heap_guard =
            HeapGuard::install(&mut runtime, options.limits.heap_ceiling_bytes(), flags.clone());
        let isolate = runtime.v8_isolate().thread_safe_handle();
        let (handles, check_points) = match initialize(&mut runtime) {
            Ok(resolved) => resolved,
            Err(e) => {
                drop(runtime);
                drop(heap_guard);
                return Err(e);
            }
        };

        let init = WorkerInit {
            isolate_handle: isolate.clone(),
            check_points,
        };
        let worker = Self {
            handles,
            runtime,
            _heap_guard: heap_guard,
            platform: options.platform,
            flags,
            isolate,
            limits: options.limits,
            _snapshot: snapshot,
        };
        Ok((worker, init))
    }

    /// Process commands until shutdown or until every handle is gone.
    pub(crate) fn run(
        mut self,
        name: &str,
        mut cmd_rx: mpsc::UnboundedReceiver<InstanceCommand>,
        terminated: Arc<AtomicBool>,
    ) {
        tracing::debug!("[worker:{}] Ready", name);
        while let Some(cmd) = cmd_rx.blocking_recv() {
            if terminated.load(Ordering::SeqCst) {
                break;
            }
            match cmd {
                InstanceCommand::Check { request, reply } => {
                    let _ = reply.send(self.check(request));
                }
                InstanceCommand::ExecScript {
                    source,
                    filename,
                    reply,
                } => {
                    let _ = reply.send(self.exec_script(&source, &filename));
                }
                InstanceCommand::Log { message, reply } => {
                    let _ = reply.send(self.log(&message));
                }
                InstanceCommand::HeapStatistics { reply } => {
                    let _ = reply.send(Ok(self.heap_statistics()));
                }
                InstanceCommand::Shutdown => break,
            }
        }
        tracing::debug!("[worker:{}] Exiting", name);
    }

    /// Clear a termination left over from an earlier watchdog.
    fn prepare(&mut self) -> Result<(), SandboxError> {
        if self.flags.out_of_memory() {
            return Err(SandboxError::Terminated);
        }
        self.flags.clear_timeout();
        self.isolate.cancel_terminate_execution();
        Ok(())
    }

    fn check(&mut self, request: CheckRequest) -> Result<Verdicts, SandboxError> {
        self.prepare()?;
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.limits.check_timeout());

        let Self {
            handles,
            runtime,
            platform,
            flags,
            isolate,
            ..
        } = self;
        let scope = &mut runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);

        let check_point = v8::String::new(tc, &request.check_point)
            .ok_or_else(|| SandboxError::InvalidParams("check point name too long".into()))?;
        let params_text = v8::String::new(tc, &request.params)
            .ok_or_else(|| SandboxError::InvalidParams("parameters too long".into()))?;
        let Some(params) = v8::json::parse(tc, params_text) else {
            let detail = format_exception(tc);
            tc.reset();
            return Err(SandboxError::InvalidParams(detail));
        };
        let context = request_context(tc, &mut handles.context, request.context.as_deref())?;

        let function = v8::Local::new(tc, &handles.check_fn);
        let receiver: v8::Local<v8::Value> = v8::undefined(tc).into();
        let args = [check_point.into(), params, context.into()];

        let watchdog = WatchdogGuard::arm(platform, isolate.clone(), flags.clone(), timeout);
        let result = function.call(tc, receiver, &args);
        if result.is_some() {
            tc.perform_microtask_checkpoint();
        }
        watchdog.release();

        Ok(normalize(tc, result, flags))
    }

    fn exec_script(&mut self, source: &str, filename: &str) -> Result<serde_json::Value, SandboxError> {
        self.prepare()?;
        let Self {
            runtime,
            platform,
            flags,
            isolate,
            limits,
            ..
        } = self;
        let scope = &mut runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);

        let watchdog =
            WatchdogGuard::arm(platform, isolate.clone(), flags.clone(), limits.exec_timeout());
        let result = run_script(tc, source, filename, 0);
        if result.is_some() {
            tc.perform_microtask_checkpoint();
        }
        watchdog.release();

        match result {
            Some(value) if !terminated(tc) => {
                Ok(to_json(tc, value).unwrap_or(serde_json::Value::Null))
            }
            _ => {
                let message = if flags.out_of_memory() {
                    OOM_MESSAGE.to_string()
                } else if terminated(tc) && flags.timed_out() {
                    TIMEOUT_MESSAGE.to_string()
                } else {
                    format_exception(tc)
                };
                if !flags.out_of_memory() {
                    tc.cancel_terminate_execution();
                }
                Err(SandboxError::JavaScript(message))
            }
        }
    }

    fn log(&mut self, message: &str) -> Result<(), SandboxError> {
        self.prepare()?;
        let scope = &mut self.runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let function = v8::Local::new(tc, &self.handles.log_fn);
        let text = v8::String::new(tc, message)
            .ok_or_else(|| SandboxError::InvalidParams("log message too long".into()))?;
        let receiver: v8::Local<v8::Value> = v8::undefined(tc).into();
        if function.call(tc, receiver, &[text.into()]).is_none() {
            return Err(SandboxError::JavaScript(format_exception(tc)));
        }
        Ok(())
    }

    fn heap_statistics(&mut self) -> HeapUsage {
        let mut stats = v8::HeapStatistics::default();
        self.runtime.v8_isolate().get_heap_statistics(&mut stats);
        HeapUsage {
            used_heap_size: stats.used_heap_size(),
            total_heap_size: stats.total_heap_size(),
            heap_size_limit: stats.heap_size_limit(),
        }
    }
}

/// Resolve `RASP.check`, `console.log` and `checkPoints` from the global object.
fn initialize(runtime: &mut JsRuntime) -> Result<(CachedHandles, BTreeSet<String>), SandboxError> {
    let scope = &mut runtime.handle_scope();
    let context = scope.get_current_context();
    let global = context.global(scope);

    let rasp = get_object(scope, global, "RASP")?;
    let check_fn = get_function(scope, rasp, "check")?;
    let console = get_object(scope, global, "console")?;
    let log_fn = get_function(scope, console, "log")?;

    let mut check_points = BTreeSet::new();
    let points = get_property(scope, global, "checkPoints")
        .and_then(|value| v8::Local::<v8::Array>::try_from(value).ok())
        .ok_or_else(|| SandboxError::Builtins("checkPoints is missing".into()))?;
    for index in 0..points.length() {
        if let Some(name) = points.get_index(scope, index) {
            check_points.insert(name.to_rust_string_lossy(scope));
        }
    }

    let handles = CachedHandles {
        check_fn: v8::Global::new(scope, check_fn),
        log_fn: v8::Global::new(scope, log_fn),
        context: None,
    };
    Ok((handles, check_points))
}

fn get_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Object>, SandboxError> {
    get_property(scope, object, name)
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| SandboxError::Builtins(format!("{} is missing", name)))
}

fn get_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Function>, SandboxError> {
    get_property(scope, object, name)
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| SandboxError::Builtins(format!("{} is not a function", name)))
}

/// The JS object for `context`, reusing the cached one for the same request.
fn request_context<'s>(
    scope: &mut v8::HandleScope<'s>,
    cache: &mut Option<(u64, v8::Global<v8::Object>)>,
    context: Option<&RequestContext>,
) -> Result<v8::Local<'s, v8::Object>, SandboxError> {
    let Some(context) = context else {
        return Ok(v8::Object::new(scope));
    };
    if let Some((id, object)) = cache.as_ref() {
        if *id == context.id() {
            return Ok(v8::Local::new(scope, object));
        }
    }

    let value = serde_v8::to_v8(scope, context)
        .map_err(|e| SandboxError::InvalidParams(format!("request context: {}", e)))?;
    let object = v8::Local::<v8::Object>::try_from(value)
        .map_err(|_| SandboxError::InvalidParams("request context is not an object".into()))?;

    if let Some(body) = &context.body {
        let store = v8::ArrayBuffer::new_backing_store_from_vec(body.clone()).make_shared();
        let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
        if let Some(key) = v8::String::new(scope, "body") {
            object.set(scope, key.into(), buffer.into());
        }
    }

    *cache = Some((context.id(), v8::Global::new(scope, object)));
    Ok(object)
}
