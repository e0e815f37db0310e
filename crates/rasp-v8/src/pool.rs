//! Instance pools and the current-snapshot store.
//!
//! Two policies share the [`InstancePool`] interface:
//!
//! - [`PerThreadPool`] caches one instance per calling thread.
//! - [`SharedPool`] keeps up to `max_instances` instances and hands out the
//!   least busy one.
//!
//! Both rebuild from the [`SnapshotStore`] under its swap lock, so a rebuild
//! never races an installation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::{PoolConfig, PoolPolicy};
use crate::error::SandboxError;
use crate::instance::{Instance, InstanceOptions};
use crate::platform::Platform;
use crate::snapshot::Snapshot;

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot store
// ─────────────────────────────────────────────────────────────────────────────

/// The installed snapshot.
///
/// Readers get an `Arc` and never observe a half-swapped pointer. The
/// timestamp is mirrored in an atomic so expiry checks on the acquire path
/// take no lock.
#[derive(Default)]
pub struct SnapshotStore {
    current: RwLock<Option<Arc<Snapshot>>>,
    timestamp: AtomicU64,
    swap_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `snapshot` current and return it as installed.
    ///
    /// A snapshot that is not newer than the current one is re-stamped to
    /// `current + 1`, so installing always expires existing instances.
    pub fn install(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>, SandboxError> {
        if !snapshot.is_ok() {
            return Err(SandboxError::InvalidSnapshot);
        }

        let _swap = self.swap_lock.lock();
        let mut current = self.current.write();
        let latest = self.timestamp.load(Ordering::SeqCst);
        let snapshot = if current.is_some() && snapshot.timestamp() <= latest {
            tracing::debug!(
                "[SnapshotStore::install] Re-stamping snapshot {} -> {}",
                snapshot.timestamp(),
                latest + 1
            );
            snapshot.with_timestamp(latest + 1)
        } else {
            snapshot
        };

        let snapshot = Arc::new(snapshot);
        self.timestamp.store(snapshot.timestamp(), Ordering::SeqCst);
        *current = Some(snapshot.clone());
        tracing::info!(
            "Snapshot installed: {} bytes, timestamp {}",
            snapshot.raw_size(),
            snapshot.timestamp()
        );
        Ok(snapshot)
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    /// Timestamp of the current snapshot, 0 when none is installed.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// The swap lock, held by pools while they build instances.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.swap_lock.lock()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pool interface
// ─────────────────────────────────────────────────────────────────────────────

/// Hands out instances to calling threads.
pub trait InstancePool: Send + Sync {
    /// A live instance built from the current snapshot.
    fn acquire(&self) -> Result<InstanceLease, SandboxError>;

    /// Live instances held by the pool.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every instance. Later acquisitions build fresh ones.
    fn clear(&self);

    fn policy(&self) -> PoolPolicy;
}

/// An acquired instance. Dropping the lease returns it to the pool.
pub struct InstanceLease {
    instance: Arc<Instance>,
}

impl InstanceLease {
    fn new(instance: Arc<Instance>) -> Self {
        instance.lease();
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn release(self) {}
}

impl Deref for InstanceLease {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.instance.unlease();
    }
}

/// Build a pool for `config.policy`.
pub fn new_pool(
    config: &PoolConfig,
    snapshots: Arc<SnapshotStore>,
    options: InstanceOptions,
) -> Box<dyn InstancePool> {
    let factory = InstanceFactory { snapshots, options };
    match config.policy {
        PoolPolicy::PerThread => Box::new(PerThreadPool::new(factory)),
        PoolPolicy::Shared => Box::new(SharedPool::new(
            factory,
            config.max_instances,
            config.max_concurrency,
        )),
    }
}

struct InstanceFactory {
    snapshots: Arc<SnapshotStore>,
    options: InstanceOptions,
}

impl InstanceFactory {
    /// Build from the current snapshot. Callers hold the store lock.
    fn build(&self) -> Result<Instance, SandboxError> {
        let snapshot = self.snapshots.current().ok_or(SandboxError::NoSnapshot)?;
        Instance::new(
            snapshot,
            Platform::current_clock_millis(),
            self.options.clone(),
        )
    }

    fn usable(&self, instance: &Instance) -> bool {
        !instance.is_dead() && !instance.is_expired(self.snapshots.timestamp())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-thread policy
// ─────────────────────────────────────────────────────────────────────────────

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Pool id -> this thread's instance.
    static THREAD_INSTANCES: RefCell<HashMap<u64, Arc<Instance>>> = RefCell::new(HashMap::new());
}

/// One cached instance per calling thread, rebuilt when expired or dead.
pub struct PerThreadPool {
    id: u64,
    factory: InstanceFactory,
    /// Every instance handed to some thread, for `clear`.
    instances: Mutex<Vec<Weak<Instance>>>,
}

impl PerThreadPool {
    fn new(factory: InstanceFactory) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            instances: Mutex::new(Vec::new()),
        }
    }
}

impl InstancePool for PerThreadPool {
    fn acquire(&self) -> Result<InstanceLease, SandboxError> {
        let cached = THREAD_INSTANCES.with(|cell| cell.borrow().get(&self.id).cloned());
        if let Some(instance) = cached {
            if self.factory.usable(&instance) {
                return Ok(InstanceLease::new(instance));
            }
            tracing::debug!(
                "[PerThreadPool::acquire] Retiring instance {} (dead: {})",
                instance.id(),
                instance.is_dead()
            );
            THREAD_INSTANCES.with(|cell| cell.borrow_mut().remove(&self.id));
        }

        let instance = {
            let _lock = self.factory.snapshots.lock();
            Arc::new(self.factory.build()?)
        };
        THREAD_INSTANCES.with(|cell| cell.borrow_mut().insert(self.id, instance.clone()));

        let mut instances = self.instances.lock();
        instances.retain(|weak| weak.strong_count() > 0);
        instances.push(Arc::downgrade(&instance));
        Ok(InstanceLease::new(instance))
    }

    fn len(&self) -> usize {
        self.instances
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|instance| !instance.is_dead())
            .count()
    }

    fn clear(&self) {
        let instances = std::mem::take(&mut *self.instances.lock());
        for instance in instances.iter().filter_map(Weak::upgrade) {
            instance.close();
        }
    }

    fn policy(&self) -> PoolPolicy {
        PoolPolicy::PerThread
    }
}

impl Drop for PerThreadPool {
    fn drop(&mut self) {
        self.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared policy
// ─────────────────────────────────────────────────────────────────────────────

/// Up to `max_instances` instances shared by every thread.
pub struct SharedPool {
    factory: InstanceFactory,
    instances: RwLock<Vec<Arc<Instance>>>,
    max_instances: usize,
    max_concurrency: usize,
}

impl SharedPool {
    fn new(factory: InstanceFactory, max_instances: usize, max_concurrency: usize) -> Self {
        Self {
            factory,
            instances: RwLock::new(Vec::new()),
            max_instances: max_instances.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Least busy usable instance; saturated ones only if `saturated_ok`.
    fn pick(&self, instances: &[Arc<Instance>], saturated_ok: bool) -> Option<Arc<Instance>> {
        instances
            .iter()
            .filter(|instance| self.factory.usable(instance))
            .filter(|instance| saturated_ok || instance.in_flight() < self.max_concurrency)
            .min_by_key(|instance| instance.in_flight())
            .cloned()
    }
}

impl InstancePool for SharedPool {
    fn acquire(&self) -> Result<InstanceLease, SandboxError> {
        if let Some(instance) = self.pick(&self.instances.read(), false) {
            return Ok(InstanceLease::new(instance));
        }

        let retired: Vec<Arc<Instance>>;
        let lease = {
            let _lock = self.factory.snapshots.lock();
            {
                let mut instances = self.instances.write();
                let (live, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut *instances)
                    .into_iter()
                    .partition(|instance| self.factory.usable(instance));
                *instances = live;
                retired = stale;
            }

            let instances = self.instances.read();
            if let Some(instance) = self.pick(&instances, false) {
                InstanceLease::new(instance)
            } else if instances.len() >= self.max_instances {
                match self.pick(&instances, true) {
                    Some(instance) => InstanceLease::new(instance),
                    None => return Err(SandboxError::Terminated),
                }
            } else {
                drop(instances);
                let instance = Arc::new(self.factory.build()?);
                tracing::debug!(
                    "[SharedPool::acquire] Built instance {} ({} of {})",
                    instance.id(),
                    self.instances.read().len() + 1,
                    self.max_instances
                );
                self.instances.write().push(instance.clone());
                InstanceLease::new(instance)
            }
        };

        if !retired.is_empty() {
            tracing::debug!("[SharedPool::acquire] Retired {} instances", retired.len());
        }
        // Joining retired workers happens outside both locks.
        drop(retired);
        Ok(lease)
    }

    fn len(&self) -> usize {
        self.instances.read().len()
    }

    fn clear(&self) {
        let instances = std::mem::take(&mut *self.instances.write());
        for instance in &instances {
            instance.close();
        }
    }

    fn policy(&self) -> PoolPolicy {
        PoolPolicy::Shared
    }
}
