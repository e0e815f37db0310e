mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::{plugins, sandbox_with, test_config};
use rasp_v8::{CheckRequest, PoolPolicy, SandboxServices};
use serde_json::json;

const PLUGIN: &str = "const p = new RASP('v'); p.register('sql', () => ({ message: version }));";

fn shared_config(max_instances: usize, max_concurrency: usize) -> rasp_v8::EngineConfig {
    let mut config = test_config();
    config.pool.policy = PoolPolicy::Shared;
    config.pool.max_instances = max_instances;
    config.pool.max_concurrency = max_concurrency;
    config
}

fn message(sandbox: &rasp_v8::Sandbox) -> String {
    sandbox
        .check(CheckRequest::new("sql", &json!({})))
        .unwrap()
        .iter_typed()
        .next()
        .unwrap()
        .message
}

#[test]
fn test_per_thread_pool_reuses_instance_on_same_thread() {
    let sandbox = sandbox_with(test_config(), SandboxServices::default(), &[("v.js", PLUGIN)]);
    assert_eq!(sandbox.pool().policy(), PoolPolicy::PerThread);

    let first = sandbox.acquire().unwrap().id();
    let second = sandbox.acquire().unwrap().id();
    assert_eq!(first, second);

    let other = thread::scope(|scope| {
        scope
            .spawn(|| sandbox.acquire().unwrap().id())
            .join()
            .unwrap()
    });
    assert_ne!(first, other);
}

#[test]
fn test_per_thread_pool_rebuilds_after_new_snapshot() {
    let sandbox = sandbox_with(test_config(), SandboxServices::default(), &[("v.js", PLUGIN)]);
    let old = sandbox.acquire().unwrap().instance().clone();
    assert_eq!(message(&sandbox), "1.2.3");

    sandbox
        .build_snapshot(None, plugins(&[("v.js", PLUGIN)]), "1.2.4")
        .unwrap();
    let current = sandbox.current_snapshot().unwrap().timestamp();
    assert!(old.is_expired(current));

    let fresh = sandbox.acquire().unwrap();
    assert_ne!(fresh.id(), old.id());
    assert!(!fresh.is_expired(current));
    drop(fresh);
    assert_eq!(message(&sandbox), "1.2.4");
}

#[test]
fn test_shared_pool_prefers_least_busy_instance() {
    let sandbox = sandbox_with(shared_config(2, 1), SandboxServices::default(), &[("v.js", PLUGIN)]);
    assert_eq!(sandbox.pool().policy(), PoolPolicy::Shared);

    let first = sandbox.acquire().unwrap();
    let first_id = first.id();
    drop(first);
    // Released, so it is handed out again instead of building another.
    let a = sandbox.acquire().unwrap();
    assert_eq!(a.id(), first_id);
    assert_eq!(sandbox.pool().len(), 1);

    // `a` is saturated with max_concurrency 1.
    let b = sandbox.acquire().unwrap();
    assert_ne!(b.id(), a.id());
    assert_eq!(sandbox.pool().len(), 2);

    // At the cap: share an existing instance rather than build a third.
    let c = sandbox.acquire().unwrap();
    assert!(c.id() == a.id() || c.id() == b.id());
    assert_eq!(sandbox.pool().len(), 2);
}

#[test]
fn test_shared_pool_retires_expired_instances() {
    let sandbox = sandbox_with(shared_config(2, 5), SandboxServices::default(), &[("v.js", PLUGIN)]);
    let old = sandbox.acquire().unwrap().id();
    assert_eq!(message(&sandbox), "1.2.3");

    sandbox
        .build_snapshot(None, plugins(&[("v.js", PLUGIN)]), "1.2.4")
        .unwrap();
    let fresh = sandbox.acquire().unwrap().id();
    assert_ne!(fresh, old);
    assert_eq!(sandbox.pool().len(), 1);
    assert_eq!(message(&sandbox), "1.2.4");
}

#[test]
fn test_shared_pool_under_concurrent_checks() {
    let sandbox = Arc::new(sandbox_with(
        shared_config(2, 2),
        SandboxServices::default(),
        &[("v.js", PLUGIN)],
    ));

    let ids: HashSet<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sandbox = sandbox.clone();
                scope.spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..10 {
                        let lease = sandbox.acquire().unwrap();
                        let verdicts = lease
                            .check(CheckRequest::new("sql", &json!({})))
                            .unwrap();
                        assert_eq!(verdicts.len(), 1);
                        seen.push(lease.id());
                    }
                    seen
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });
    assert!(!ids.is_empty());
    assert!(sandbox.pool().len() <= 2);
}

#[test]
fn test_clear_closes_instances() {
    let sandbox = sandbox_with(shared_config(2, 5), SandboxServices::default(), &[("v.js", PLUGIN)]);
    let instance = sandbox.acquire().unwrap().instance().clone();
    sandbox.pool().clear();
    assert!(instance.is_dead());
    assert!(sandbox.pool().is_empty());

    // A fresh instance is built on demand.
    assert_eq!(message(&sandbox), "1.2.3");
}

#[test]
fn test_loaded_snapshot_is_installed() {
    let sandbox = sandbox_with(test_config(), SandboxServices::default(), &[("v.js", PLUGIN)]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugins.snapshot");
    let before = sandbox.current_snapshot().unwrap();
    before.save(&path).unwrap();

    let loaded = sandbox.load_snapshot(&path).unwrap();
    assert!(loaded.timestamp() > before.timestamp());
    assert_eq!(loaded.data(), before.data());
    assert_eq!(message(&sandbox), "1.2.3");
}
