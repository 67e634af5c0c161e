//! In-memory [`CloudApi`] that records every call and answers from stubs.
//!
//! Stubs match on HTTP method plus a path fragment; the first matching stub
//! wins and single-use stubs are consumed. Calls with no matching stub
//! succeed with `{}`.

use crate::api::{ApiCall, CloudApi, HttpMethod};
use crate::config::CloudContext;
use crate::error::{GcpError, GcpResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Reply {
    Json(Value),
    Status(u16),
}

#[derive(Debug, Clone)]
struct Stub {
    method: HttpMethod,
    fragment: String,
    reply: Reply,
    once: bool,
}

/// A recorded signed-URL upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub size: usize,
}

pub struct FakeCloud {
    context: CloudContext,
    stubs: Mutex<Vec<Stub>>,
    calls: Mutex<Vec<ApiCall>>,
    head_headers: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    uploads: Mutex<Vec<Upload>>,
}

impl FakeCloud {
    pub fn new(project: &str, location: &str) -> Self {
        Self::with_context(CloudContext::new(project, location).with_project_number("123456"))
    }

    pub fn with_context(context: CloudContext) -> Self {
        Self {
            context,
            stubs: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            head_headers: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, method: HttpMethod, fragment: &str, reply: Reply, once: bool) -> &Self {
        if let Ok(mut stubs) = self.stubs.lock() {
            stubs.push(Stub {
                method,
                fragment: fragment.to_string(),
                reply,
                once,
            });
        }
        self
    }

    /// Answer every matching call with `body`.
    pub fn on(&self, method: HttpMethod, fragment: &str, body: Value) -> &Self {
        self.push(method, fragment, Reply::Json(body), false)
    }

    /// Answer the next matching call with `body`.
    pub fn once(&self, method: HttpMethod, fragment: &str, body: Value) -> &Self {
        self.push(method, fragment, Reply::Json(body), true)
    }

    /// Fail every matching call with an HTTP status.
    pub fn fail(&self, method: HttpMethod, fragment: &str, status: u16) -> &Self {
        self.push(method, fragment, Reply::Status(status), false)
    }

    /// Fail the next matching call with an HTTP status.
    pub fn fail_once(&self, method: HttpMethod, fragment: &str, status: u16) -> &Self {
        self.push(method, fragment, Reply::Status(status), true)
    }

    /// Headers returned by `HEAD` for URLs containing `fragment`.
    pub fn on_head(&self, fragment: &str, headers: &[(&str, &str)]) -> &Self {
        if let Ok(mut heads) = self.head_headers.lock() {
            heads.push((
                fragment.to_string(),
                headers
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                    .collect(),
            ));
        }
        self
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Every state-changing call.
    pub fn writes(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method.is_write())
            .collect()
    }

    pub fn calls_to(&self, method: HttpMethod, fragment: &str) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path.contains(fragment))
            .collect()
    }

    pub fn count(&self, method: HttpMethod, fragment: &str) -> usize {
        self.calls_to(method, fragment).len()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn reply_for(&self, call: &ApiCall) -> Option<Reply> {
        let mut stubs = self.stubs.lock().ok()?;
        let idx = stubs
            .iter()
            .position(|s| s.method == call.method && call.path.contains(&s.fragment))?;
        let reply = stubs[idx].reply.clone();
        if stubs[idx].once {
            stubs.remove(idx);
        }
        Some(reply)
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    fn context(&self) -> &CloudContext {
        &self.context
    }

    async fn send(&self, call: ApiCall) -> GcpResult<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.clone());
        }
        match self.reply_for(&call) {
            Some(Reply::Json(v)) => Ok(v),
            Some(Reply::Status(code)) => Err(GcpError::new(
                &call.service,
                code,
                status_name(code),
                &format!("stubbed {} for {}", code, call.describe()),
            )),
            None => Ok(Value::Object(Default::default())),
        }
    }

    async fn head(&self, url: &str) -> GcpResult<BTreeMap<String, String>> {
        let heads = self
            .head_headers
            .lock()
            .map_err(|_| GcpError::from_str("storage", "poisoned"))?;
        Ok(heads
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, h)| h.clone())
            .unwrap_or_default())
    }

    async fn upload(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> GcpResult<()> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(Upload {
                url: url.to_string(),
                headers: headers.to_vec(),
                size: body.len(),
            });
        }
        Ok(())
    }

    async fn upload_media(
        &self,
        service: &str,
        path: &str,
        query: &[(String, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> GcpResult<Value> {
        let mut url = format!("{}/{}", service, path);
        if let Some((_, name)) = query.iter().find(|(k, _)| k == "name") {
            url = format!("{}?name={}", url, name);
        }
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push(Upload {
                url,
                headers: vec![("content-type".to_string(), content_type.to_string())],
                size: body.len(),
            });
        }
        Ok(Value::Object(Default::default()))
    }
}

fn status_name(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ALREADY_EXISTS",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "UNKNOWN",
    }
}
