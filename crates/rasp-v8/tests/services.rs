mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use common::{WhitespaceTokenizer, sandbox_with, test_config};
use parking_lot::Mutex;
use rasp_v8::{
    CheckRequest, HttpClient, HttpError, HttpResponse, OutboundRequest, SandboxServices,
};
use serde_json::json;

struct MockClient {
    requests: Mutex<Vec<OutboundRequest>>,
    notify: Mutex<mpsc::Sender<String>>,
}

impl MockClient {
    fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let client = Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            notify: Mutex::new(tx),
        });
        (client, rx)
    }
}

impl HttpClient for MockClient {
    fn send(&self, request: &OutboundRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().push(request.clone());
        let _ = self.notify.lock().send(request.url.clone());
        if request.url.contains("unreachable") {
            return Err(HttpError::Transport("connection refused".into()));
        }
        Ok(HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            data: "pong".into(),
        })
    }
}

#[test]
fn test_sql_tokenize_uses_tokenizer() {
    let source = r#"
const p = new RASP('tok');
p.register('sql', (params) => ({
  message: p.sql_tokenize(params.query).map((t) => t.text + '@' + t.start).join('|'),
}));
p.register('command', (params) => ({ message: String(p.cmd_tokenize(params.command).length) }));
"#;
    let services = SandboxServices::default().with_tokenizer(Arc::new(WhitespaceTokenizer));
    let sandbox = sandbox_with(test_config(), services, &[("tok.js", source)]);

    let verdicts = sandbox
        .check(CheckRequest::new("sql", &json!({"query": "select é from t"})))
        .unwrap();
    assert_eq!(
        verdicts.iter_typed().next().unwrap().message,
        "select@0|é@7|from@9|t@14"
    );

    let verdicts = sandbox
        .check(CheckRequest::new("command", &json!({"command": "ls -la /tmp"})))
        .unwrap();
    assert_eq!(verdicts.iter_typed().next().unwrap().message, "3");
}

#[test]
fn test_tokenize_without_tokenizer_is_empty() {
    let source = "const p = new RASP('tok'); p.register('sql', (params) => ({ message: String(p.sql_tokenize(params.query).length) }));";
    let sandbox = sandbox_with(test_config(), SandboxServices::default(), &[("tok.js", source)]);
    let verdicts = sandbox
        .check(CheckRequest::new("sql", &json!({"query": "select 1"})))
        .unwrap();
    assert_eq!(verdicts.iter_typed().next().unwrap().message, "0");
}

#[test]
fn test_request_resolves_and_rejects() {
    let source = r#"
const p = new RASP('http');
p.register('ssrf', async (params) => {
  try {
    const res = await p.request({ url: params.url, method: 'get' });
    return { action: 'block', message: res.status + ' ' + res.data + ' ' + res.config.url };
  } catch (e) {
    return { action: 'log', message: 'failed: ' + e.error.message };
  }
});
"#;
    let (client, _rx) = MockClient::new();
    let services = SandboxServices::default().with_http(client.clone());
    let sandbox = sandbox_with(test_config(), services, &[("http.js", source)]);

    let ok = sandbox
        .check(CheckRequest::new("ssrf", &json!({"url": "http://service.local/ping"})))
        .unwrap();
    assert_eq!(
        ok.iter_typed().next().unwrap().message,
        "200 pong http://service.local/ping"
    );

    let failed = sandbox
        .check(CheckRequest::new("ssrf", &json!({"url": "http://unreachable.local/"})))
        .unwrap();
    assert_eq!(
        failed.iter_typed().next().unwrap().message,
        "failed: connection refused"
    );
    assert_eq!(client.requests.lock().len(), 2);
}

#[test]
fn test_request_async_is_queued() {
    let source = r#"
const p = new RASP('report');
p.register('sql', (params) => ({
  message: String(p.request_async({ url: 'http://collector.local/report', method: 'post', data: params })),
}));
"#;
    let (client, rx) = MockClient::new();
    let services = SandboxServices::default().with_http(client.clone());
    let sandbox = sandbox_with(test_config(), services, &[("report.js", source)]);

    let verdicts = sandbox
        .check(CheckRequest::new("sql", &json!({"query": "select 1"})))
        .unwrap();
    assert_eq!(verdicts.iter_typed().next().unwrap().message, "true");

    let url = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(url, "http://collector.local/report");
    let requests = client.requests.lock();
    assert_eq!(requests[0].method.as_deref(), Some("post"));
    assert_eq!(requests[0].data, Some(json!({"query": "select 1"})));
}

#[test]
fn test_request_async_without_client_returns_false() {
    let source = r#"
const p = new RASP('report');
p.register('sql', () => ({ message: String(p.request_async({ url: 'http://collector.local/' })) }));
"#;
    let sandbox = sandbox_with(test_config(), SandboxServices::default(), &[("report.js", source)]);
    let verdicts = sandbox
        .check(CheckRequest::new("sql", &json!({})))
        .unwrap();
    assert_eq!(verdicts.iter_typed().next().unwrap().message, "false");
}
