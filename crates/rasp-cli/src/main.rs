//! RASP plugin sandbox CLI
//!
//! Builds plugin snapshots and runs checks against them.

mod plugins;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rasp_v8::{EngineConfig, PluginSource, Sandbox, Snapshot};

use plugins::{CheckLine, PluginSet, load_plugin_dir};
use watcher::PluginWatcher;

/// RASP plugin sandbox
#[derive(Parser, Debug)]
#[command(name = "rasp")]
#[command(about = "Build and run sandboxed RASP detection plugins", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a snapshot from a plugin directory
    Build {
        /// Directory holding the plugin `*.js` files
        #[arg(short, long)]
        plugins: PathBuf,

        /// Config script evaluated before the plugins
        #[arg(long)]
        config_script: Option<PathBuf>,

        /// Version string exposed to plugins
        #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
        plugin_version: String,

        /// Where to write the snapshot
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show a snapshot file's size and validity
    Inspect {
        snapshot: PathBuf,
    },

    /// Read check requests as JSON lines from stdin and print the verdicts
    Check {
        #[command(flatten)]
        source: SnapshotSource,

        /// Rebuild the snapshot when the plugin directory changes
        #[arg(long, requires = "plugins")]
        watch: bool,
    },

    /// Run a script in a sandbox instance and print its value
    Exec {
        script: PathBuf,

        #[command(flatten)]
        source: SnapshotSource,
    },
}

#[derive(clap::Args, Debug)]
struct SnapshotSource {
    /// Load a snapshot written by `rasp build`
    #[arg(long, conflicts_with = "plugins")]
    snapshot: Option<PathBuf>,

    /// Build a snapshot from this plugin directory
    #[arg(short, long)]
    plugins: Option<PathBuf>,

    /// Config script evaluated before the plugins
    #[arg(long, requires = "plugins")]
    config_script: Option<PathBuf>,

    /// Version string exposed to plugins
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    plugin_version: String,
}

impl SnapshotSource {
    fn plugin_set(&self) -> Option<PluginSet> {
        self.plugins.as_ref().map(|dir| PluginSet {
            dir: dir.clone(),
            config_script: self.config_script.clone(),
            version: self.plugin_version.clone(),
        })
    }

    /// Install the configured snapshot into `sandbox`. Blocking.
    fn install(&self, sandbox: &Sandbox) -> Result<()> {
        match (&self.snapshot, self.plugin_set()) {
            (Some(path), _) => {
                let snapshot = sandbox
                    .load_snapshot(path)
                    .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
                info!("Loaded snapshot {} ({} bytes)", path.display(), snapshot.raw_size());
                Ok(())
            }
            (None, Some(set)) => set.install(sandbox).map(|_| ()),
            (None, None) => bail!("either --snapshot or --plugins is required"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // V8 is initialized on the main thread before the tokio runtime starts.
    rasp_v8::initialize(&config)?;

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?
        .block_on(async_main(args, config));

    rasp_v8::shutdown();
    result
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rasp=info,rasp_v8=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn async_main(args: Args, config: EngineConfig) -> Result<()> {
    match args.command {
        Command::Build {
            plugins,
            config_script,
            plugin_version,
            output,
        } => {
            let set = PluginSet {
                dir: plugins,
                config_script,
                version: plugin_version,
            };
            blocking(move || build(config, set, &output)).await
        }
        Command::Inspect { snapshot } => inspect(&snapshot),
        Command::Check { source, watch } => check(config, source, watch).await,
        Command::Exec { script, source } => {
            blocking(move || {
                let sandbox = Sandbox::new(config)?;
                source.install(&sandbox)?;
                let code = std::fs::read_to_string(&script)
                    .with_context(|| format!("Failed to read {}", script.display()))?;
                let filename = script
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| String::from("script.js"));
                let value = sandbox.exec_script(&code, &filename)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
                sandbox.dispose();
                Ok(())
            })
            .await
        }
    }
}

/// Run blocking sandbox work off the async workers.
async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Blocking task panicked")?
}

fn build(config: EngineConfig, set: PluginSet, output: &Path) -> Result<()> {
    let sandbox = Sandbox::new(config)?;
    let plugins: Vec<PluginSource> = load_plugin_dir(&set.dir)?;
    let count = plugins.len();
    let mut builder = sandbox
        .snapshot_builder()
        .plugins(plugins)
        .version(set.version.as_str());
    if let Some(path) = &set.config_script {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config script {}", path.display()))?;
        builder = builder.config(source);
    }
    let snapshot = builder.build().context("Failed to build snapshot")?;
    snapshot
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        "Wrote {} ({} bytes, {} plugins)",
        output.display(),
        snapshot.raw_size(),
        count
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    let snapshot = Snapshot::load(path, modified)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let report = serde_json::json!({
        "path": path.display().to_string(),
        "valid": snapshot.is_ok(),
        "size": snapshot.raw_size(),
        "timestamp": snapshot.timestamp(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn check(config: EngineConfig, source: SnapshotSource, watch: bool) -> Result<()> {
    let sandbox = Arc::new(Sandbox::new(config)?);
    let plugin_set = source.plugin_set();
    {
        let sandbox = sandbox.clone();
        blocking(move || source.install(&sandbox)).await?;
    }

    let mut watcher = match (&plugin_set, watch) {
        (Some(set), true) => Some(PluginWatcher::new(&set.dir).context("Failed to watch plugins")?),
        _ => None,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let output = run_check_line(&sandbox, &line).await;
                stdout.write_all(output.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Some(changed) = next_change(&mut watcher) => {
                info!("Plugin changed: {}, rebuilding", changed.display());
                if let Some(set) = plugin_set.clone() {
                    let sandbox = sandbox.clone();
                    if let Err(e) = blocking(move || set.install(&sandbox)).await {
                        warn!("Rebuild failed, keeping current snapshot: {:#}", e);
                    }
                }
            }
        }
    }

    drop(watcher);
    if let Ok(sandbox) = Arc::try_unwrap(sandbox) {
        blocking(move || {
            sandbox.dispose();
            Ok(())
        })
        .await?;
    }
    Ok(())
}

async fn next_change(watcher: &mut Option<PluginWatcher>) -> Option<PathBuf> {
    match watcher {
        Some(watcher) => watcher.next_change().await,
        None => std::future::pending().await,
    }
}

/// One output line: the verdict array, or `{"error": ...}`.
///
/// Acquiring may build an isolate, so it runs on the blocking pool; only the
/// check itself is awaited here.
async fn run_check_line(sandbox: &Arc<Sandbox>, line: &str) -> String {
    let request = match CheckLine::parse(line) {
        Ok(line) => line.into_request(),
        Err(e) => return serde_json::json!({ "error": format!("{:#}", e) }).to_string(),
    };
    let acquired = {
        let sandbox = sandbox.clone();
        blocking(move || Ok(sandbox.acquire()?)).await
    };
    let lease = match acquired {
        Ok(lease) => lease,
        Err(e) => return serde_json::json!({ "error": format!("{:#}", e) }).to_string(),
    };
    match lease.check_async(request).await {
        Ok(verdicts) => verdicts.to_json().unwrap_or_else(|| String::from("[]")),
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    }
}
