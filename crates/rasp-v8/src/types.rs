//! Types crossing the host boundary: check requests, request contexts and
//! the verdict list a check produces.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_context_id() -> u64 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-request information handed to plugins as their third argument.
///
/// A context is created once per host request and shared by every check made
/// while serving it, so state a plugin stores on the object during `request`
/// is still there at `requestEnd` when the same instance serves both.
///
/// Every value has its own id: default-built, deserialized and cloned
/// contexts never alias one another inside an instance.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestContext {
    #[serde(skip, default = "next_context_id")]
    id: u64,
    pub url: Option<String>,
    pub header: BTreeMap<String, String>,
    pub parameter: BTreeMap<String, Vec<String>>,
    pub path: Option<String>,
    pub querystring: Option<String>,
    pub method: Option<String>,
    pub protocol: Option<String>,
    pub remote_addr: Option<String>,
    pub app_base_path: Option<String>,
    pub server: Option<Value>,
    pub json: Option<Value>,
    pub request_id: Option<String>,
    /// Raw request body, exposed to JS as an `ArrayBuffer`.
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            id: next_context_id(),
            url: None,
            header: BTreeMap::new(),
            parameter: BTreeMap::new(),
            path: None,
            querystring: None,
            method: None,
            protocol: None,
            remote_addr: None,
            app_base_path: None,
            server: None,
            json: None,
            request_id: None,
            body: None,
            extra: Map::new(),
        }
    }
}

/// A clone is a different request and gets a new id.
impl Clone for RequestContext {
    fn clone(&self) -> Self {
        Self {
            id: next_context_id(),
            url: self.url.clone(),
            header: self.header.clone(),
            parameter: self.parameter.clone(),
            path: self.path.clone(),
            querystring: self.querystring.clone(),
            method: self.method.clone(),
            protocol: self.protocol.clone(),
            remote_addr: self.remote_addr.clone(),
            app_base_path: self.app_base_path.clone(),
            server: self.server.clone(),
            json: self.json.clone(),
            request_id: self.request_id.clone(),
            body: self.body.clone(),
            extra: self.extra.clone(),
        }
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a new process-unique id.
    pub fn with_fresh_id(mut self) -> Self {
        self.id = next_context_id();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Check request
// ─────────────────────────────────────────────────────────────────────────────

/// One plugin invocation: check point, JSON parameters, context and deadline.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub check_point: String,
    /// Parameters as JSON text; parsed inside the isolate.
    pub params: String,
    pub context: Option<Arc<RequestContext>>,
    /// Falls back to the configured check timeout.
    pub timeout: Option<Duration>,
}

impl CheckRequest {
    pub fn new(check_point: impl Into<String>, params: &Value) -> Self {
        Self {
            check_point: check_point.into(),
            params: params.to_string(),
            context: None,
            timeout: None,
        }
    }

    /// Build from parameters that are already JSON text.
    pub fn from_json(check_point: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            check_point: check_point.into(),
            params: params.into(),
            context: None,
            timeout: None,
        }
    }

    pub fn with_context(mut self, context: Arc<RequestContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verdicts
// ─────────────────────────────────────────────────────────────────────────────

/// Message carried by the verdict emitted when the watchdog fires.
pub const TIMEOUT_MESSAGE: &str = "Javascript plugin execution timeout";

/// Message carried by the verdict emitted when a heap guard kills the call.
pub const OOM_MESSAGE: &str = "Javascript plugin heap out of memory";

/// What a plugin asks the host to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Ignore,
    Log,
    Block,
    /// Synthetic: the plugin failed, timed out or ran out of memory.
    Exception,
    #[serde(other)]
    Unknown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ignore => "ignore",
            Action::Log => "log",
            Action::Block => "block",
            Action::Exception => "exception",
            Action::Unknown => "unknown",
        }
    }
}

fn default_action() -> Action {
    Action::Log
}

/// Typed view of one verdict entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default = "default_action")]
    pub action: Action,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Verdict {
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            action: Action::Exception,
            message: message.into(),
            name: None,
            confidence: None,
            extra: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Ordered verdicts produced by one check.
///
/// Entries are kept exactly as the plugins produced them; [`Verdicts::iter_typed`]
/// offers a typed view that skips entries which are not verdict objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdicts(Vec<Value>);

impl Verdicts {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self(vec![Verdict::exception(message).to_value()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    pub fn iter_typed(&self) -> impl Iterator<Item = Verdict> + '_ {
        self.0
            .iter()
            .filter(|value| value.is_object())
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Actions in order, `Unknown` for entries without a readable action.
    pub fn actions(&self) -> Vec<Action> {
        self.0
            .iter()
            .map(|value| {
                value
                    .get("action")
                    .cloned()
                    .and_then(|action| serde_json::from_value(action).ok())
                    .unwrap_or(Action::Unknown)
            })
            .collect()
    }

    /// Whether any entry asks to block the request.
    pub fn is_block(&self) -> bool {
        self.actions().contains(&Action::Block)
    }

    /// JSON array text, or `None` for the empty fast path.
    pub fn to_json(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        serde_json::to_string(&self.0).ok()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Verdicts {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl IntoIterator for Verdicts {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_ids_are_unique() {
        let a = RequestContext::default();
        let b = RequestContext::default();
        let c = a.clone();
        let d: RequestContext = serde_json::from_value(json!({"url": "http://d/"})).unwrap();
        let e: RequestContext = serde_json::from_value(json!({"url": "http://d/"})).unwrap();

        let ids = [a.id(), b.id(), c.id(), d.id(), e.id()];
        assert!(ids.iter().all(|id| *id != 0));
        for (i, id) in ids.iter().enumerate() {
            assert!(!ids[i + 1..].contains(id), "duplicate id {}", id);
        }
        assert_eq!(d.url.as_deref(), Some("http://d/"));
    }

    #[test]
    fn test_empty_verdicts_have_no_json() {
        let verdicts = Verdicts::empty();
        assert!(verdicts.is_empty());
        assert_eq!(verdicts.to_json(), None);
    }

    #[test]
    fn test_typed_view_fills_defaults_and_keeps_extras() {
        let verdicts = Verdicts::from(vec![
            json!({"action": "block", "message": "sqli", "name": "sql", "confidence": 90, "algorithm": "sqli_userinput"}),
            json!({"message": "no action given"}),
            json!(42),
        ]);

        let typed: Vec<Verdict> = verdicts.iter_typed().collect();
        assert_eq!(typed.len(), 2);
        assert_eq!(typed[0].action, Action::Block);
        assert_eq!(typed[0].name.as_deref(), Some("sql"));
        assert_eq!(typed[0].confidence, Some(90.0));
        assert_eq!(typed[0].extra["algorithm"], json!("sqli_userinput"));
        assert_eq!(typed[1].action, Action::Log);

        assert_eq!(
            verdicts.actions(),
            vec![Action::Block, Action::Unknown, Action::Unknown]
        );
        assert!(verdicts.is_block());
    }

    #[test]
    fn test_unknown_action_string() {
        let verdict: Verdict = serde_json::from_value(json!({"action": "quarantine"})).unwrap();
        assert_eq!(verdict.action, Action::Unknown);
    }

    #[test]
    fn test_exception_verdict_json() {
        let verdicts = Verdicts::exception(TIMEOUT_MESSAGE);
        let text = verdicts.to_json().unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["action"], "exception");
        assert!(parsed[0]["message"].as_str().unwrap().contains("timeout"));
    }

    #[test]
    fn test_context_serializes_camel_case() {
        let mut context = RequestContext::new();
        context.remote_addr = Some("10.0.0.1".into());
        context.app_base_path = Some("/srv".into());
        context.body = Some(b"secret".to_vec());
        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["remoteAddr"], "10.0.0.1");
        assert_eq!(value["appBasePath"], "/srv");
        assert!(value.get("body").is_none());
    }
}
