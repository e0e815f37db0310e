//! Host services reachable from plugin code.
//!
//! Services are stored in each runtime's `OpState` and read by the ops in
//! [`crate::ops`]. Every service is optional; a missing one degrades the
//! matching builtin (empty token list, rejected request, log to tracing).

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::http::HttpClient;

/// Lexer used by `RASP.sql_tokenize` and `RASP.cmd_tokenize`.
pub trait Tokenizer: Send + Sync + 'static {
    /// Tokenize `input` and return flat `[start, stop, start, stop, ...]` offsets.
    ///
    /// `mode` is the dialect requested by the plugin (e.g. `mysql`, `bash`).
    fn tokenize(&self, input: &str, mode: &str) -> Vec<i32>;
}

/// Sink for plugin console output.
pub trait PluginLogger: Send + Sync + 'static {
    fn log(&self, message: &str);
}

/// Services that can be accessed from JavaScript.
#[derive(Clone, Default)]
pub struct SandboxServices {
    /// Client behind `RASP.request` and `RASP.request_async`
    pub http: Option<Arc<dyn HttpClient>>,
    /// Lexer for the tokenize builtins
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    /// Plugin log sink; defaults to tracing
    pub logger: Option<Arc<dyn PluginLogger>>,
    /// Queue for fire-and-forget requests
    pub dispatcher: Option<Arc<Dispatcher>>,
}

impl SandboxServices {
    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn PluginLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub(crate) fn log(&self, message: &str) {
        match &self.logger {
            Some(logger) => logger.log(message),
            None => tracing::info!(target: "rasp::plugin", "{}", message),
        }
    }
}

impl std::fmt::Debug for SandboxServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxServices")
            .field("http", &self.http.is_some())
            .field("tokenizer", &self.tokenizer.is_some())
            .field("logger", &self.logger.is_some())
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}
