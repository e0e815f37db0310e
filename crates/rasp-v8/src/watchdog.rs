//! Execution watchdogs.
//!
//! A [`WatchdogTask`] runs on the platform worker pool and terminates an
//! isolate's execution unless the calling thread releases it before the
//! deadline. Heap exhaustion is caught by two hooks installed on every
//! runtime: a GC epilogue that compares used heap against a ceiling, and the
//! near-heap-limit callback.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use deno_core::{JsRuntime, v8};

use crate::platform::Platform;

/// Flags shared between an instance, its watchdogs and its heap hooks.
#[derive(Debug, Default)]
pub struct InstanceFlags {
    timeout: AtomicBool,
    oom: AtomicBool,
}

impl InstanceFlags {
    pub fn timed_out(&self) -> bool {
        self.timeout.load(Ordering::SeqCst)
    }

    pub fn out_of_memory(&self) -> bool {
        self.oom.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_timeout(&self) {
        self.timeout.store(false, Ordering::SeqCst);
    }

    /// Set the OOM flag; true only for the first caller.
    pub(crate) fn mark_oom(&self) -> bool {
        !self.oom.swap(true, Ordering::SeqCst)
    }
}

/// Background half of a watchdog: waits for release or the deadline.
pub(crate) struct WatchdogTask {
    isolate: v8::IsolateHandle,
    flags: Arc<InstanceFlags>,
    release: mpsc::Receiver<()>,
    deadline: Instant,
}

impl WatchdogTask {
    pub(crate) fn run(self) {
        let wait = self.deadline.saturating_duration_since(Instant::now());
        match self.release.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.flags.timeout.store(true, Ordering::SeqCst);
                self.isolate.terminate_execution();
                tracing::debug!("[watchdog] Deadline passed, execution terminated");
            }
            // Released, or the guard was dropped.
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
        }
    }
}

/// Calling-thread half of a watchdog. Releasing or dropping it cancels the deadline.
#[must_use = "the watchdog is released as soon as the guard is dropped"]
pub(crate) struct WatchdogGuard {
    release: Option<mpsc::Sender<()>>,
}

impl WatchdogGuard {
    /// Arm a watchdog that terminates `isolate` after `timeout`.
    pub(crate) fn arm(
        platform: &Platform,
        isolate: v8::IsolateHandle,
        flags: Arc<InstanceFlags>,
        timeout: Duration,
    ) -> Self {
        let (release_tx, release_rx) = mpsc::channel();
        let task = WatchdogTask {
            isolate,
            flags,
            release: release_rx,
            deadline: Instant::now() + timeout,
        };
        platform.call_on_worker_thread(move || task.run());
        Self {
            release: Some(release_tx),
        }
    }

    /// Best effort: a watchdog already past its deadline may still fire.
    pub(crate) fn release(mut self) {
        self.notify();
    }

    fn notify(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.notify();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heap guards
// ─────────────────────────────────────────────────────────────────────────────

/// State read by the GC epilogue callback.
pub(crate) struct HeapGuard {
    ceiling: usize,
    flags: Arc<InstanceFlags>,
}

impl HeapGuard {
    /// Install both heap hooks on `runtime`.
    ///
    /// The returned box is handed to V8 as callback data and must outlive the
    /// runtime.
    pub(crate) fn install(
        runtime: &mut JsRuntime,
        ceiling: usize,
        flags: Arc<InstanceFlags>,
    ) -> Box<HeapGuard> {
        let guard = Box::new(HeapGuard {
            ceiling,
            flags: flags.clone(),
        });

        runtime.v8_isolate().add_gc_epilogue_callback(
            gc_epilogue_callback,
            &*guard as *const HeapGuard as *mut c_void,
            v8::GCType::ALL,
        );

        let isolate = runtime.v8_isolate().thread_safe_handle();
        runtime.add_near_heap_limit_callback(move |current, initial| {
            if flags.mark_oom() {
                tracing::warn!(
                    "Heap limit reached (current {} bytes, initial {} bytes), terminating",
                    current,
                    initial
                );
            }
            isolate.terminate_execution();
            // Headroom for the termination to unwind; the instance is dead now.
            current * 2
        });

        runtime.v8_isolate().set_oom_error_handler(oom_error_handler);
        guard
    }
}

extern "C" fn gc_epilogue_callback(
    isolate: *mut v8::Isolate,
    _gc_type: v8::GCType,
    _flags: v8::GCCallbackFlags,
    data: *mut c_void,
) {
    // SAFETY: `data` is the `HeapGuard` boxed in `HeapGuard::install`, which the
    // worker keeps alive until after its runtime (and so the isolate) is dropped.
    // V8 calls this on the isolate's own thread, so `isolate` is valid and
    // not aliased for the duration of the call.
    let guard = unsafe { &*(data as *const HeapGuard) };
    let isolate = unsafe { &mut *isolate };

    let mut stats = v8::HeapStatistics::default();
    isolate.get_heap_statistics(&mut stats);
    if stats.used_heap_size() > guard.ceiling {
        if guard.flags.mark_oom() {
            tracing::warn!(
                "Heap usage {} bytes exceeds ceiling {} bytes, terminating",
                stats.used_heap_size(),
                guard.ceiling
            );
        }
        isolate.terminate_execution();
    }
}

extern "C" fn oom_error_handler(location: *const std::os::raw::c_char, details: &v8::OomDetails) {
    let location = if location.is_null() {
        String::from("<unknown>")
    } else {
        // SAFETY: V8 passes a NUL-terminated string that lives for the call.
        unsafe { std::ffi::CStr::from_ptr(location) }
            .to_string_lossy()
            .into_owned()
    };
    tracing::error!(
        "V8 out of memory at {} (heap: {})",
        location,
        details.is_heap_oom
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_is_marked_once() {
        let flags = InstanceFlags::default();
        assert!(!flags.out_of_memory());
        assert!(flags.mark_oom());
        assert!(!flags.mark_oom());
        assert!(flags.out_of_memory());
    }

    #[test]
    fn test_timeout_flag_resets() {
        let flags = InstanceFlags::default();
        flags.timeout.store(true, Ordering::SeqCst);
        assert!(flags.timed_out());
        flags.clear_timeout();
        assert!(!flags.timed_out());
    }
}
