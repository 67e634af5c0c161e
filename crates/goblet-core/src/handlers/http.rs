//! Plain HTTP invocations of the backend root, selected by request headers.

use super::RequestFn;
use crate::error::{GobletError, GobletResult};
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Clone)]
struct HttpEntry {
    name: String,
    headers: BTreeMap<String, String>,
    function: RequestFn,
}

impl HttpEntry {
    /// An empty required value only asks for the header to be present.
    fn accepts(&self, request: &Request) -> bool {
        self.headers.iter().all(|(k, v)| match request.header(k) {
            Some(actual) => v.is_empty() || actual == v,
            None => false,
        })
    }
}

#[derive(Clone, Default)]
pub struct Http {
    resources: Vec<HttpEntry>,
}

impl Http {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries are tried in registration order.
    pub fn register(&mut self, name: &str, function: RequestFn, headers: BTreeMap<String, String>) {
        self.resources.push(HttpEntry {
            name: name.to_string(),
            headers,
            function,
        });
    }

    pub fn merge(&mut self, other: &Http) {
        self.resources.extend(other.resources.iter().cloned());
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.iter().map(|e| e.name.as_str()).collect()
    }
}

#[async_trait]
impl Resource for Http {
    fn resource_type(&self) -> &'static str {
        "http"
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    // served by the backend itself
    async fn deploy(&mut self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
        Ok(())
    }
}

impl Handler for Http {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let entry = self
            .resources
            .iter()
            .find(|e| e.accepts(request))
            .ok_or_else(|| GobletError::NotFound("No http handler matches the request headers".into()))?;
        Ok((entry.function)(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn tagged(tag: &'static str) -> RequestFn {
        Arc::new(move |_: &Request| Response::from(tag))
    }

    #[test]
    fn test_first_matching_entry_wins() {
        let mut http = Http::new();
        let mut admin = BTreeMap::new();
        admin.insert("X-Role".to_string(), "admin".to_string());
        http.register("admin", tagged("admin"), admin);
        let mut traced = BTreeMap::new();
        traced.insert("X-Trace".to_string(), String::new());
        http.register("traced", tagged("traced"), traced);
        http.register("fallback", tagged("fallback"), BTreeMap::new());

        let req = Request::get("/").with_header("x-role", "admin").with_header("X-Trace", "1");
        assert_eq!(http.dispatch(&req, None).unwrap().body, json!("admin"));
        let req = Request::get("/").with_header("X-Role", "user").with_header("X-Trace", "1");
        assert_eq!(http.dispatch(&req, None).unwrap().body, json!("traced"));
        assert_eq!(http.dispatch(&Request::get("/"), None).unwrap().body, json!("fallback"));
    }

    #[test]
    fn test_no_match_is_not_found() {
        let mut http = Http::new();
        let mut needs = BTreeMap::new();
        needs.insert("X-Key".to_string(), "k".to_string());
        http.register("keyed", tagged("k"), needs);
        assert!(matches!(http.dispatch(&Request::get("/"), None), Err(GobletError::NotFound(_))));
    }
}
