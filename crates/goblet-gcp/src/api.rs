//! The uniform call surface every Google Cloud request goes through.
//!
//! An [`ApiCall`] is a fully-resolved REST request (service host, method,
//! versioned path, query, JSON body). [`CloudApi`] is the seam between
//! the deployment engine and the network: [`crate::client::GcpClient`]
//! sends calls over HTTPS, [`crate::testing::FakeCloud`] answers them in
//! memory.

use crate::config::CloudContext;
use crate::error::GcpResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Anything but GET changes cloud state.
    pub fn is_write(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved REST request against `https://{service}.googleapis.com/{path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub service: String,
    pub method: HttpMethod,
    /// Path below the host, without a leading slash (e.g. `v1/projects/p/topics/t`).
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiCall {
    pub fn new(service: &str, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Short `METHOD path` form used in logs and test assertions.
    pub fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Transport used by every collection, helper and resource.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Project and location used to render parent schemas.
    fn context(&self) -> &CloudContext;

    /// Send a JSON REST call. Non-2xx responses become [`crate::GcpError`].
    async fn send(&self, call: ApiCall) -> GcpResult<Value>;

    /// `HEAD` an absolute URL (signed download URLs) and return its headers,
    /// lower-cased.
    async fn head(&self, url: &str) -> GcpResult<BTreeMap<String, String>>;

    /// `PUT` raw bytes to an absolute URL (signed upload URLs, no bearer token).
    async fn upload(&self, url: &str, headers: &[(String, String)], body: Vec<u8>)
        -> GcpResult<()>;

    /// Authorized media upload: `POST {path}` on `service` with a raw body.
    async fn upload_media(
        &self,
        service: &str,
        path: &str,
        query: &[(String, String)],
        content_type: &str,
        body: Vec<u8>,
    ) -> GcpResult<Value>;
}
