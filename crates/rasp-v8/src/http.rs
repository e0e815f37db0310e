//! Outbound HTTP for plugins.
//!
//! `RASP.request(config)` runs synchronously through an [`HttpClient`];
//! `RASP.request_async(config)` hands the same request to the bounded
//! dispatcher and never reports the outcome back to the plugin.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::HttpConfig;
use crate::dispatcher::Dispatcher;

/// Response bodies logged for failed async requests are cut to this many chars.
const LOGGED_BODY_CHARS: usize = 1024;

/// Request description as passed by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboundRequest {
    pub method: Option<String>,
    pub url: String,
    pub params: BTreeMap<String, Value>,
    pub data: Option<Value>,
    pub headers: BTreeMap<String, Value>,
    /// Milliseconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub data: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Transport(String),
}

/// Performs plugin HTTP requests. Called from instance and dispatcher threads.
pub trait HttpClient: Send + Sync + 'static {
    fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, HttpError>;
}

/// Default client backed by reqwest's blocking API.
///
/// The underlying client is created on first use so it is never built on an
/// async runtime thread.
pub struct ReqwestClient {
    config: HttpConfig,
    client: OnceLock<Result<reqwest::blocking::Client, String>>,
}

impl ReqwestClient {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, HttpError> {
        self.client
            .get_or_init(|| {
                reqwest::blocking::Client::builder()
                    .timeout(Duration::from_millis(self.config.timeout_ms))
                    .redirect(reqwest::redirect::Policy::limited(self.config.max_redirects))
                    .danger_accept_invalid_certs(self.config.accept_invalid_certs)
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| HttpError::Transport(e.clone()))
    }
}

impl HttpClient for ReqwestClient {
    fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, HttpError> {
        let client = self.client()?;
        let method = request.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        let query: Vec<(&str, String)> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), value_to_text(v)))
            .collect();

        let mut builder = client.request(method, &request.url).query(&query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value_to_text(value));
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        builder = match &request.data {
            None | Some(Value::Null) => builder,
            Some(Value::String(text)) => builder.body(text.clone()),
            Some(other) => builder.json(other),
        };

        let response = builder
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let data = response
            .text()
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            data,
        })
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Post a fire-and-forget request. Returns `false` if the dispatcher rejects it.
pub(crate) fn queue_request(
    dispatcher: &Dispatcher,
    client: Arc<dyn HttpClient>,
    request: OutboundRequest,
) -> bool {
    dispatcher.post(move || match client.send(&request) {
        Err(e) => tracing::warn!("queue request failed: {}", e),
        Ok(response) if !response.is_success() => {
            let body: String = response.data.chars().take(LOGGED_BODY_CHARS).collect();
            tracing::warn!("queue request status: {} body: {}", response.status, body);
        }
        Ok(_) => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::mpsc;

    struct RecordingClient {
        seen: Mutex<Vec<String>>,
        done: Mutex<mpsc::Sender<()>>,
    }

    impl HttpClient for RecordingClient {
        fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, HttpError> {
            self.seen.lock().push(request.url.clone());
            let _ = self.done.lock().send(());
            Ok(HttpResponse {
                status: 503,
                headers: BTreeMap::new(),
                data: "unavailable".into(),
            })
        }
    }

    #[test]
    fn test_request_config_from_plugin_shape() {
        let request: OutboundRequest = serde_json::from_value(serde_json::json!({
            "method": "post",
            "url": "http://127.0.0.1:1/report",
            "params": {"id": 1},
            "data": {"hello": "world"},
            "headers": {"x-token": "abc"},
            "timeout": 200
        }))
        .unwrap();

        assert_eq!(request.method.as_deref(), Some("post"));
        assert_eq!(request.timeout, Some(200));
        assert_eq!(value_to_text(&request.params["id"]), "1");
        assert_eq!(value_to_text(&request.headers["x-token"]), "abc");
    }

    #[test]
    fn test_queue_request_runs_on_dispatcher() {
        let dispatcher = Dispatcher::new("test-http", 1, 4).unwrap();
        let (tx, rx) = mpsc::channel();
        let client = Arc::new(RecordingClient {
            seen: Mutex::new(Vec::new()),
            done: Mutex::new(tx),
        });

        let request = OutboundRequest {
            url: "http://example.invalid/a".into(),
            ..Default::default()
        };
        assert!(queue_request(&dispatcher, client.clone(), request));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(client.seen.lock().as_slice(), ["http://example.invalid/a"]);
    }

    #[test]
    fn test_queue_request_rejected_after_terminate() {
        let dispatcher = Dispatcher::new("test-http-terminated", 1, 4).unwrap();
        dispatcher.terminate();
        let (tx, _rx) = mpsc::channel();
        let client = Arc::new(RecordingClient {
            seen: Mutex::new(Vec::new()),
            done: Mutex::new(tx),
        });
        assert!(!queue_request(&dispatcher, client, OutboundRequest::default()));
    }

    #[test]
    fn test_success_range() {
        let mut response = HttpResponse {
            status: 204,
            headers: BTreeMap::new(),
            data: String::new(),
        };
        assert!(response.is_success());
        response.status = 302;
        assert!(!response.is_success());
    }
}
