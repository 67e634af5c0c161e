//! Inbound invocation model: HTTP request, legacy event context, response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Event metadata for background (non-HTTP) Cloud Functions invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub event_type: String,
    #[serde(default)]
    pub resource: String,
}

impl EventContext {
    pub fn new(event_type: &str, resource: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// An HTTP request (or the event payload of a background invocation).
///
/// Header names are stored lower-cased; lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub path: String,
    headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    /// A background event carrying `data` (no method, no path).
    pub fn event(data: Value) -> Self {
        Self {
            body: Some(data),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// True when the header is present and non-empty.
    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The body when it is a JSON object.
    pub fn json_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.body.as_ref().and_then(|b| b.as_object())
    }
}

/// Handler result returned to the serving runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }
}

impl Response {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            ..Default::default()
        }
    }

    /// JSON body with `Content-Type: application/json`.
    pub fn jsonify(body: Value) -> Self {
        Self::new(200, body).with_header("Content-Type", "application/json")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

impl From<&str> for Response {
    fn from(s: &str) -> Self {
        Response::new(200, Value::String(s.to_string()))
    }
}

impl From<String> for Response {
    fn from(s: String) -> Self {
        Response::new(200, Value::String(s))
    }
}

impl From<Value> for Response {
    fn from(v: Value) -> Self {
        Response::new(200, v)
    }
}

impl From<()> for Response {
    fn from(_: ()) -> Self {
        Response::default()
    }
}

impl From<(Value, u16)> for Response {
    fn from((body, status): (Value, u16)) -> Self {
        Response::new(status, body)
    }
}
