//! Sandboxed V8 execution engine for RASP detection plugins.
//!
//! Plugins are compiled into a [`Snapshot`] together with a builtin library
//! and a config script. Checks run on pooled [`Instance`]s built from the
//! current snapshot, each hosted on its own thread.
//!
//! # Architecture
//!
//! - [`platform`] initializes V8 once and owns the background threads
//! - a watchdog on those threads terminates checks that overrun their deadline
//! - heap hooks mark an instance dead when it exceeds its heap ceiling
//! - plugin results are normalized into a [`Verdicts`] list; plugin failures
//!   become `exception` verdicts instead of errors
//! - `RASP.request_async` goes through a bounded [`Dispatcher`]

mod command;
mod exception;
mod normalize;
mod ops;
mod script;
mod worker;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod instance;
pub mod platform;
pub mod pool;
pub mod sandbox;
pub mod services;
pub mod snapshot;
pub mod types;
pub mod watchdog;

pub use config::{EngineConfig, LimitsConfig, PoolConfig, PoolPolicy};
pub use dispatcher::Dispatcher;
pub use error::SandboxError;
pub use exception::source_line_window;
pub use http::{HttpClient, HttpError, HttpResponse, OutboundRequest, ReqwestClient};
pub use instance::{HeapUsage, Instance, InstanceOptions};
pub use ops::rasp_sandbox;
pub use platform::{Platform, initialize, shutdown};
pub use pool::{InstanceLease, InstancePool, SnapshotStore, new_pool};
pub use sandbox::Sandbox;
pub use services::{PluginLogger, SandboxServices, Tokenizer};
pub use snapshot::{PluginSource, Snapshot, SnapshotBuilder};
pub use types::{
    Action, CheckRequest, OOM_MESSAGE, RequestContext, TIMEOUT_MESSAGE, Verdict, Verdicts,
};
