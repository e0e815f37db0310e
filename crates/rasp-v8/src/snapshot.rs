//! Snapshot builder and persistence.
//!
//! A snapshot is a serialized V8 heap holding the builtin library, the config
//! script and every plugin, ready to be instantiated without re-running any
//! of that code.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use deno_core::{JsRuntime, JsRuntimeForSnapshot, RuntimeOptions, v8};

use crate::config::LimitsConfig;
use crate::error::SandboxError;
use crate::exception::format_exception;
use crate::ops::rasp_sandbox;
use crate::platform::{ISOLATE_CREATE_LOCK, Platform};
use crate::script::run_script;
use crate::services::SandboxServices;
use crate::types::TIMEOUT_MESSAGE;
use crate::watchdog::{InstanceFlags, WatchdogGuard};

/// Builtin library, evaluated in this order before anything else.
const BUILTINS: &[(&str, &str)] = &[
    ("checkpoint.js", include_str!("js/checkpoint.js")),
    ("console.js", include_str!("js/console.js")),
    ("tokenize.js", include_str!("js/tokenize.js")),
    ("rasp.js", include_str!("js/rasp.js")),
];

/// Immutable runtime image plus its creation time in milliseconds.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Box<[u8]>,
    timestamp: u64,
}

impl Snapshot {
    pub fn from_bytes(data: impl Into<Box<[u8]>>, timestamp: u64) -> Self {
        Self {
            data: data.into(),
            timestamp,
        }
    }

    /// Read a snapshot previously written by [`Snapshot::save`].
    pub fn load(path: impl AsRef<Path>, timestamp: u64) -> io::Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(data, timestamp))
    }

    /// Write the image to `path` through a temporary file and an atomic rename.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        if !self.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to save an invalid snapshot",
            ));
        }
        let path = path.as_ref();
        let tmp = tmp_path(path);
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.data)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }

    /// Non-empty data.
    pub fn is_ok(&self) -> bool {
        !self.data.is_empty()
    }

    /// Strictly newer timestamps expire the snapshot.
    pub fn is_expired(&self, timestamp: u64) -> bool {
        timestamp > self.timestamp
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_size(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn with_timestamp(self, timestamp: u64) -> Self {
        Self { timestamp, ..self }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("raw_size", &self.raw_size())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// One plugin file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    pub name: String,
    pub source: String,
}

impl PluginSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Builds a [`Snapshot`] from a config script and plugins.
pub struct SnapshotBuilder {
    platform: Arc<Platform>,
    config: Option<String>,
    plugins: Vec<PluginSource>,
    version: String,
    host_data: Option<serde_json::Value>,
    timestamp: Option<u64>,
    services: SandboxServices,
    load_timeout: Duration,
}

impl SnapshotBuilder {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            config: None,
            plugins: Vec::new(),
            version: String::new(),
            host_data: None,
            timestamp: None,
            services: SandboxServices::default(),
            load_timeout: LimitsConfig::default().load_timeout(),
        }
    }

    /// Config script, evaluated after the builtins and before any plugin.
    pub fn config(mut self, source: impl Into<String>) -> Self {
        self.config = Some(source.into());
        self
    }

    pub fn plugin(mut self, plugin: PluginSource) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn plugins(mut self, plugins: impl IntoIterator<Item = PluginSource>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Exposed to plugins as the global `version`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Opaque host value, exposed to plugins as the global `hostData`.
    pub fn host_data(mut self, data: serde_json::Value) -> Self {
        self.host_data = Some(data);
        self
    }

    /// Defaults to the wall clock at build time.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Services reachable by top-level plugin code while loading.
    pub fn services(mut self, services: SandboxServices) -> Self {
        self.services = services;
        self
    }

    /// Budget for each script evaluated during the build.
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Build the image on a dedicated thread, tearing the isolate down before
    /// returning.
    pub fn build(self) -> Result<Snapshot, SandboxError> {
        let handle = thread::Builder::new()
            .name("rasp-snapshot".into())
            .spawn(move || self.build_on_current_thread())
            .map_err(SandboxError::SpawnFailed)?;
        handle.join().map_err(|_| SandboxError::ThreadPanic)?
    }

    fn build_on_current_thread(self) -> Result<Snapshot, SandboxError> {
        let timestamp = self
            .timestamp
            .unwrap_or_else(Platform::current_clock_millis);
        tracing::debug!(
            "[SnapshotBuilder::build] {} plugins, version {:?}, timestamp {}",
            self.plugins.len(),
            self.version,
            timestamp
        );

        let mut runtime = {
            let _lock = ISOLATE_CREATE_LOCK.lock();
            JsRuntimeForSnapshot::new(RuntimeOptions {
                extensions: vec![rasp_sandbox::init_ops()],
                ..Default::default()
            })
        };
        runtime.op_state().borrow_mut().put(self.services.clone());

        let mut loader = ScriptLoader {
            platform: &self.platform,
            isolate: runtime.v8_isolate().thread_safe_handle(),
            flags: Arc::new(InstanceFlags::default()),
            timeout: self.load_timeout,
        };

        let version = serde_json::to_string(&self.version)
            .map_err(|e| SandboxError::Builtins(e.to_string()))?;
        let mut prelude = format!("globalThis.version = {};", version);
        if let Some(data) = &self.host_data {
            prelude.push_str(&format!("\nglobalThis.hostData = {};", data));
        }
        loader
            .load(&mut runtime, &prelude, "prelude.js", 0)
            .map_err(SandboxError::Builtins)?;
        for (name, source) in BUILTINS {
            loader
                .load(&mut runtime, source, name, 0)
                .map_err(|e| SandboxError::Builtins(format!("{}: {}", name, e)))?;
        }

        if let Some(config) = &self.config {
            if let Err(e) = loader.load(&mut runtime, config, "config.js", 0) {
                tracing::warn!("Failed to load config.js: {}", e);
            }
        }

        for plugin in &self.plugins {
            let wrapped = format!("(function(){{\n{}\n}})()", plugin.source);
            match loader.load(&mut runtime, &wrapped, &plugin.name, -1) {
                Ok(()) => tracing::debug!("[SnapshotBuilder::build] Loaded {}", plugin.name),
                Err(e) => tracing::warn!("Failed to load plugin {}: {}", plugin.name, e),
            }
        }

        let data = runtime.snapshot();
        let snapshot = Snapshot::from_bytes(data, timestamp);
        if !snapshot.is_ok() {
            return Err(SandboxError::InvalidSnapshot);
        }
        tracing::info!(
            "Snapshot built: {} bytes, {} plugins, timestamp {}",
            snapshot.raw_size(),
            self.plugins.len(),
            timestamp
        );
        Ok(snapshot)
    }
}

/// Evaluates build-time scripts under a watchdog.
struct ScriptLoader<'a> {
    platform: &'a Platform,
    isolate: v8::IsolateHandle,
    flags: Arc<InstanceFlags>,
    timeout: Duration,
}

impl ScriptLoader<'_> {
    fn load(
        &mut self,
        runtime: &mut JsRuntime,
        source: &str,
        filename: &str,
        line_offset: i32,
    ) -> Result<(), String> {
        self.flags.clear_timeout();
        self.isolate.cancel_terminate_execution();

        let scope = &mut runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);

        let watchdog = WatchdogGuard::arm(
            self.platform,
            self.isolate.clone(),
            self.flags.clone(),
            self.timeout,
        );
        let result = run_script(tc, source, filename, line_offset);
        if result.is_some() {
            tc.perform_microtask_checkpoint();
        }
        watchdog.release();

        if result.is_some() && !tc.has_terminated() {
            return Ok(());
        }
        let message = if tc.has_terminated() && self.flags.timed_out() {
            TIMEOUT_MESSAGE.to_string()
        } else {
            format_exception(tc).trim_end().to_string()
        };
        if tc.has_terminated() {
            tc.cancel_terminate_execution();
        }
        Err(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_is_invalid() {
        let snapshot = Snapshot::from_bytes(Vec::new(), 1);
        assert!(!snapshot.is_ok());
        assert_eq!(snapshot.raw_size(), 0);
        assert!(Snapshot::from_bytes(vec![1u8], 1).is_ok());
    }

    #[test]
    fn test_expiry_is_strict() {
        let snapshot = Snapshot::from_bytes(vec![1u8, 2, 3], 1000);
        assert!(!snapshot.is_expired(999));
        assert!(!snapshot.is_expired(1000));
        assert!(snapshot.is_expired(1001));
    }

    #[test]
    fn test_save_then_load_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.snapshot");
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let snapshot = Snapshot::from_bytes(data.clone(), 42);

        snapshot.save(&path).unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = Snapshot::load(&path, 42).unwrap();
        assert_eq!(loaded.data(), &data[..]);
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.snapshot");
        fs::write(&path, b"old").unwrap();

        Snapshot::from_bytes(b"new image".to_vec(), 1).save(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new image");
    }

    #[test]
    fn test_save_rejects_invalid_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.snapshot");
        let err = Snapshot::from_bytes(Vec::new(), 1).save(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!path.exists());
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("plugins.snapshot");
        assert!(Snapshot::from_bytes(vec![1u8], 1).save(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Snapshot::load(dir.path().join("absent"), 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
