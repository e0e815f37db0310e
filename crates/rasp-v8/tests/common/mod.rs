#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rasp_v8::{EngineConfig, PluginLogger, PluginSource, Sandbox, SandboxServices, Tokenizer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rasp_v8=debug")
        .with_test_writer()
        .try_init();
}

/// Defaults with a check timeout generous enough for slow machines.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.limits.check_timeout_ms = 5000;
    config
}

pub fn plugins(sources: &[(&str, &str)]) -> Vec<PluginSource> {
    sources
        .iter()
        .map(|(name, source)| PluginSource::new(*name, *source))
        .collect()
}

/// A sandbox with `sources` installed as its snapshot.
pub fn sandbox_with(config: EngineConfig, services: SandboxServices, sources: &[(&str, &str)]) -> Sandbox {
    init_tracing();
    let sandbox = Sandbox::with_services(config, services).unwrap();
    sandbox
        .build_snapshot(None, plugins(sources), "1.2.3")
        .unwrap();
    sandbox
}

pub fn sandbox(sources: &[(&str, &str)]) -> Sandbox {
    sandbox_with(test_config(), SandboxServices::default(), sources)
}

/// Collects plugin output.
#[derive(Default)]
pub struct CollectingLogger {
    pub lines: Mutex<Vec<String>>,
}

impl PluginLogger for CollectingLogger {
    fn log(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }
}

impl CollectingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

/// Splits on ASCII whitespace and reports byte offsets.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, input: &str, _mode: &str) -> Vec<i32> {
        let mut offsets = Vec::new();
        let mut start = None;
        for (index, byte) in input.bytes().enumerate() {
            match (byte.is_ascii_whitespace(), start) {
                (false, None) => start = Some(index),
                (true, Some(begin)) => {
                    offsets.push(begin as i32);
                    offsets.push(index as i32);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(begin) = start {
            offsets.push(begin as i32);
            offsets.push(input.len() as i32);
        }
        offsets
    }
}
