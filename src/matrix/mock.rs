use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{Value, json};

use super::urlencoding::encode;
use super::{ApiResponse, HomeserverTransport, MatrixError};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub access_token: Option<String>,
}

impl RecordedRequest {
    pub fn body_str(&self, field: &str) -> Option<&str> {
        self.body.as_ref()?.get(field)?.as_str()
    }
}

struct Route {
    method: Method,
    path: String,
    status: u16,
    body: Value,
    remaining: Option<usize>,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> bool {
        if self.method != *method || self.remaining == Some(0) {
            return false;
        }
        match self.path.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => self.path == path,
        }
    }
}

/// Scripted home server: answers from a route table and records every request.
///
/// Later routes win over earlier ones. Unmatched requests succeed with a fresh
/// `event_id`, which is what sends and redactions expect.
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
    counter: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn on(&self, method: Method, path: &str, status: u16, body: Value) {
        self.push(method, path, status, body, None);
    }

    /// Like [`MockTransport::on`] but only answers `times` requests.
    pub fn on_times(&self, method: Method, path: &str, status: u16, body: Value, times: usize) {
        self.push(method, path, status, body, Some(times));
    }

    fn push(&self, method: Method, path: &str, status: u16, body: Value, remaining: Option<usize>) {
        self.routes.lock().push(Route {
            method,
            path: path.to_string(),
            status,
            body,
            remaining,
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    pub fn requests_to(&self, method: Method, path_prefix: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }

    /// Messages sent into `room_id`, in order.
    pub fn sent_to(&self, room_id: &str) -> Vec<RecordedRequest> {
        self.requests_to(Method::PUT, &room_path(room_id, "send/m.room.message/"))
    }

    pub fn redactions_in(&self, room_id: &str) -> Vec<RecordedRequest> {
        self.requests_to(Method::PUT, &room_path(room_id, "redact/"))
    }
}

pub fn room_path(room_id: &str, suffix: &str) -> String {
    format!("/_matrix/client/v3/rooms/{}/{}", encode(room_id), suffix)
}

#[async_trait]
impl HomeserverTransport for MockTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, MatrixError> {
        self.requests.lock().push(RecordedRequest {
            method: method.clone(),
            path: path.to_string(),
            body: body.cloned(),
            access_token: access_token.map(ToOwned::to_owned),
        });

        let mut routes = self.routes.lock();
        if let Some(route) = routes.iter_mut().rev().find(|r| r.matches(&method, path)) {
            if let Some(remaining) = route.remaining.as_mut() {
                *remaining -= 1;
            }
            return Ok(ApiResponse {
                status: route.status,
                body: route.body.clone(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse {
            status: 200,
            body: json!({ "event_id": format!("$mock{n}") }),
        })
    }
}
