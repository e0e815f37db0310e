//! Bounded worker pool.
//!
//! A fixed set of threads drains a FIFO queue of at most `capacity` tasks.
//! [`Dispatcher::post`] never blocks: it returns `false` when the queue is
//! full or the dispatcher has been terminated. Termination wakes every worker
//! and joins it; tasks still sitting in the queue are dropped unexecuted.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::SandboxError;

/// A unit of work run on a dispatcher thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    terminated: bool,
    /// Workers parked on the condvar.
    idle: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl Shared {
    /// Block until a task is available; `None` once terminated.
    fn next(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            state.idle += 1;
            self.available.wait(&mut state);
            state.idle -= 1;
        }
    }
}

/// Fixed-size thread pool over a capacity-bounded queue.
pub struct Dispatcher {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `pool_size` workers named `{name}-{n}`.
    pub fn new(name: &str, pool_size: usize, capacity: usize) -> Result<Self, SandboxError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity.min(1024)),
                terminated: false,
                idle: 0,
            }),
            available: Condvar::new(),
            capacity,
        });

        let dispatcher = Self {
            name: name.to_string(),
            shared,
            workers: Mutex::new(Vec::with_capacity(pool_size)),
        };

        for n in 0..pool_size {
            let shared = dispatcher.shared.clone();
            let thread_name = format!("{}-{}", name, n);
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(&thread_name, &shared));
            match spawned {
                Ok(handle) => dispatcher.workers.lock().push(handle),
                Err(e) => {
                    dispatcher.terminate();
                    return Err(SandboxError::SpawnFailed(e));
                }
            }
        }

        tracing::debug!(
            "[dispatcher:{}] Started {} workers, capacity {}",
            name,
            pool_size,
            capacity
        );
        Ok(dispatcher)
    }

    /// Queue a task. Returns `false` if the queue is full or terminated.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.terminated || state.tasks.len() >= self.shared.capacity {
            return false;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Queue a task only if an idle worker can start it right away.
    ///
    /// Hands the task back when every worker is busy, so the caller can run it
    /// elsewhere instead of waiting behind long-running tasks.
    pub(crate) fn post_to_idle<F>(&self, task: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.terminated || state.tasks.len() >= state.idle {
            return Err(task);
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Number of queued, not yet started tasks.
    pub fn len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().terminated
    }

    /// Stop accepting work, wake all workers and wait for them to exit.
    ///
    /// Returns once every in-flight task has finished. Idempotent.
    pub fn terminate(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.terminated = true;
            std::mem::take(&mut state.tasks)
        };
        self.shared.available.notify_all();
        if !dropped.is_empty() {
            tracing::debug!(
                "[dispatcher:{}] Dropping {} queued tasks",
                self.name,
                dropped.len()
            );
        }
        drop(dropped);

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // A task may terminate its own dispatcher.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("[dispatcher:{}] Worker thread panicked", self.name);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(name: &str, shared: &Shared) {
    tracing::debug!("[dispatcher:{}] Worker started", name);
    while let Some(task) = shared.next() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("[dispatcher:{}] Task panicked", name);
        }
    }
    tracing::debug!("[dispatcher:{}] Worker exiting", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Occupy the single worker until the returned sender fires.
    fn block_worker(dispatcher: &Dispatcher) -> mpsc::Sender<()> {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        assert!(dispatcher.post(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx
    }

    #[test]
    fn test_runs_tasks_in_fifo_order() {
        let dispatcher = Dispatcher::new("test-fifo", 1, 16).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(dispatcher.post(move || tx.send(i).unwrap()));
        }
        let seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_rejects_when_full() {
        let dispatcher = Dispatcher::new("test-full", 1, 3).unwrap();
        let release = block_worker(&dispatcher);

        for _ in 0..3 {
            assert!(dispatcher.post(|| {}));
        }
        assert_eq!(dispatcher.len(), 3);
        assert!(!dispatcher.post(|| {}));

        release.send(()).unwrap();
        dispatcher.terminate();
    }

    #[test]
    fn test_terminate_drops_queued_tasks() {
        let dispatcher = Dispatcher::new("test-terminate", 1, 8).unwrap();
        let release = block_worker(&dispatcher);

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            assert!(dispatcher.post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Release the busy worker only after terminate has marked the queue.
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = release.send(());
        });
        dispatcher.terminate();
        releaser.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(dispatcher.is_terminated());
        assert!(!dispatcher.post(|| {}));
    }

    #[test]
    fn test_post_to_idle_hands_back_when_busy() {
        let dispatcher = Dispatcher::new("test-idle", 1, 8).unwrap();
        let release = block_worker(&dispatcher);

        let (tx, rx) = mpsc::channel();
        let rejected = dispatcher.post_to_idle(move || tx.send(()).unwrap());
        let task = match rejected {
            Ok(()) => panic!("busy worker accepted a task"),
            Err(task) => task,
        };
        task();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        release.send(()).unwrap();
        // The worker parks again once the blocking task returns.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let (tx, rx) = mpsc::channel();
        let mut task: Option<Box<dyn FnOnce() + Send>> = Some(Box::new(move || tx.send(()).unwrap()));
        while let Some(pending) = task.take() {
            if let Err(pending) = dispatcher.post_to_idle(pending) {
                assert!(std::time::Instant::now() < deadline);
                thread::sleep(Duration::from_millis(5));
                task = Some(pending);
            }
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let dispatcher = Dispatcher::new("test-idempotent", 2, 4).unwrap();
        dispatcher.terminate();
        dispatcher.terminate();
        assert!(!dispatcher.post(|| {}));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let dispatcher = Dispatcher::new("test-panic", 1, 4).unwrap();
        assert!(dispatcher.post(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        assert!(dispatcher.post(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
