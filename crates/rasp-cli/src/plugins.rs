//! Plugin directory loading and the check input format.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rasp_v8::{CheckRequest, PluginSource, RequestContext, Sandbox, Snapshot};
use serde::Deserialize;
use serde_json::Value;

/// Every `*.js` file directly under `dir`, sorted by file name.
pub fn load_plugin_dir(dir: &Path) -> Result<Vec<PluginSource>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read plugin directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| is_plugin_file(path))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read plugin {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(PluginSource::new(name, source))
        })
        .collect()
}

pub fn is_plugin_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "js")
}

/// Where snapshots come from for `check` and `exec`.
#[derive(Debug, Clone)]
pub struct PluginSet {
    pub dir: PathBuf,
    pub config_script: Option<PathBuf>,
    pub version: String,
}

impl PluginSet {
    /// Build a snapshot from the directory and install it. Blocking.
    pub fn install(&self, sandbox: &Sandbox) -> Result<Arc<Snapshot>> {
        let plugins = load_plugin_dir(&self.dir)?;
        let config = match &self.config_script {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config script {}", path.display()))?,
            ),
            None => None,
        };
        let count = plugins.len();
        let snapshot = sandbox
            .build_snapshot(config.as_deref(), plugins, &self.version)
            .context("Failed to build snapshot")?;
        tracing::info!(
            "Installed {} plugins from {} ({} bytes)",
            count,
            self.dir.display(),
            snapshot.raw_size()
        );
        Ok(snapshot)
    }
}

/// One line of `rasp check` input.
#[derive(Debug, Deserialize)]
pub struct CheckLine {
    #[serde(rename = "type")]
    pub check_point: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub context: Option<RequestContext>,
    /// Milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CheckLine {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("Invalid check line")
    }

    pub fn into_request(self) -> CheckRequest {
        let params = if self.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.params
        };
        let mut request = CheckRequest::new(self.check_point, &params);
        if let Some(context) = self.context {
            request = request.with_context(Arc::new(context.with_fresh_id()));
        }
        if let Some(timeout) = self.timeout.filter(|ms| *ms > 0) {
            request = request.with_timeout(Duration::from_millis(timeout));
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_plugin_dir_sorted_js_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.js"), "// b").unwrap();
        std::fs::write(dir.path().join("a.js"), "// a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("nested.js")).unwrap();

        let plugins = load_plugin_dir(dir.path()).unwrap();
        let names: Vec<_> = plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.js", "b.js"]);
        assert_eq!(plugins[0].source, "// a");
    }

    #[test]
    fn test_missing_plugin_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_plugin_dir(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_check_line() {
        let line = CheckLine::parse(
            r#"{"type": "sql", "params": {"query": "select 1"}, "context": {"remoteAddr": "10.0.0.1"}, "timeout": 50}"#,
        )
        .unwrap();
        let request = line.into_request();
        assert_eq!(request.check_point, "sql");
        assert_eq!(request.timeout, Some(Duration::from_millis(50)));
        let context = request.context.unwrap();
        assert_eq!(context.remote_addr.as_deref(), Some("10.0.0.1"));
        assert_ne!(context.id(), 0);
        let params: Value = serde_json::from_str(&request.params).unwrap();
        assert_eq!(params["query"], "select 1");
    }

    #[test]
    fn test_check_line_defaults() {
        let request = CheckLine::parse(r#"{"type": "command"}"#).unwrap().into_request();
        assert_eq!(request.params, "{}");
        assert!(request.context.is_none());
        assert!(request.timeout.is_none());
        assert!(CheckLine::parse(r#"{"params": {}}"#).is_err());
    }
}
