//! Commands sent to an instance's worker thread.

use tokio::sync::oneshot;

use crate::error::SandboxError;
use crate::instance::HeapUsage;
use crate::types::{CheckRequest, Verdicts};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SandboxError>>;

pub(crate) enum InstanceCommand {
    /// Run the dispatch function for one check point.
    Check {
        request: CheckRequest,
        reply: Reply<Verdicts>,
    },

    /// Run a script and return its completion value as JSON.
    ExecScript {
        source: String,
        filename: String,
        reply: Reply<serde_json::Value>,
    },

    /// Write through the plugin console.
    Log {
        message: String,
        reply: Reply<()>,
    },

    HeapStatistics {
        reply: Reply<HeapUsage>,
    },

    /// Stop the worker loop and drop the runtime.
    Shutdown,
}
