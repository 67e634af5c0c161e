//! Base GCP HTTP client with OAuth2 token management.
//!
//! All GCP REST APIs follow a consistent pattern:
//! - Base URL: `https://{service}.googleapis.com`
//! - Auth: `Authorization: Bearer {access_token}`
//! - Request/Response: JSON
//! - Pagination: `pageToken` / `nextPageToken`
//!
//! This client handles token acquisition, refresh and error parsing.
//! Retries are deliberately absent: a failed call surfaces immediately.

use crate::api::{ApiCall, CloudApi, HttpMethod};
use crate::auth::{Credentials, TokenManager};
use crate::config::{default_scopes, CloudContext};
use crate::error::{GcpError, GcpResult};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Overrides the Pub/Sub endpoint for local emulators.
pub const PUBSUB_EMULATOR_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Base GCP API client.
pub struct GcpClient {
    http: Client,
    token_manager: TokenManager,
    context: CloudContext,
    endpoint_override: Option<String>,
    pubsub_emulator: Option<String>,
    user_agent: String,
}

impl GcpClient {
    /// Create a new GCP client.
    pub fn new(
        credentials: Credentials,
        context: CloudContext,
        endpoint_override: Option<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| Client::new());

        let token_manager = TokenManager::new(credentials, default_scopes(), http.clone());

        Self {
            http,
            token_manager,
            context,
            endpoint_override,
            pubsub_emulator: std::env::var(PUBSUB_EMULATOR_ENV).ok().filter(|h| !h.is_empty()),
            user_agent: format!("goblet/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Client built entirely from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let credentials = Credentials::from_env()?;
        let context = CloudContext::from_env()?;
        Ok(Self::new(credentials, context, None))
    }

    /// Service account email when the client runs with a key file.
    pub fn service_account_email(&self) -> Option<&str> {
        self.token_manager.service_account_email()
    }

    /// Build the base URL for a service.
    fn base_url(&self, service: &str) -> String {
        if service == "pubsub" {
            if let Some(ref host) = self.pubsub_emulator {
                return format!("http://{}", host);
            }
        }
        if let Some(ref url) = self.endpoint_override {
            url.trim_end_matches('/').to_string()
        } else {
            format!("https://{}.googleapis.com", service)
        }
    }

    fn uses_emulator(&self, service: &str) -> bool {
        service == "pubsub" && self.pubsub_emulator.is_some()
    }

    async fn authorize(&self, builder: RequestBuilder, service: &str) -> GcpResult<RequestBuilder> {
        if self.uses_emulator(service) {
            return Ok(builder);
        }
        let token = self
            .token_manager
            .get_token()
            .await
            .map_err(|e| GcpError::auth_error(&e))?;
        Ok(builder.bearer_auth(token))
    }
}

#[async_trait]
impl CloudApi for GcpClient {
    fn context(&self) -> &CloudContext {
        &self.context
    }

    async fn send(&self, call: ApiCall) -> GcpResult<Value> {
        let url = format!("{}/{}", self.base_url(&call.service), call.path);
        debug!(target: "goblet::client", "{} {}", call.method, url);

        let builder = match call.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
            HttpMethod::Put => self.http.put(&url),
            HttpMethod::Patch => self.http.patch(&url),
            HttpMethod::Delete => self.http.delete(&url),
        };
        let mut builder = builder
            .header("User-Agent", &self.user_agent)
            .query(&call.query);
        if let Some(ref body) = call.body {
            builder = builder.json(body);
        }
        let builder = self.authorize(builder, &call.service).await?;

        let response = builder.send().await.map_err(|e| {
            GcpError::from_str(&call.service, &format!("Request failed: {}", e))
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            GcpError::from_str(&call.service, &format!("Body read error: {}", e))
        })?;
        if status >= 400 {
            return Err(GcpError::from_api_response(&call.service, status, &text)
                .with_method(&call.describe()));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text).map_err(|e| {
            GcpError::from_str(&call.service, &format!("JSON parse error: {}", e))
        })
    }

    async fn head(&self, url: &str) -> GcpResult<BTreeMap<String, String>> {
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| GcpError::from_str("storage", &format!("Request failed: {}", e)))?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(GcpError::from_api_response("storage", status, ""));
        }
        Ok(response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect())
    }

    async fn upload(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> GcpResult<()> {
        let mut builder = self.http.put(url).body(body);
        for (k, v) in headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| GcpError::from_str("storage", &format!("Upload failed: {}", e)))?;
        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(GcpError::from_api_response("storage", status, &text));
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
        let url = format!("{}/{}", self.base_url(service), path);
        let builder = self
            .http
            .post(&url)
            .header("User-Agent", &self.user_agent)
            .header("Content-Type", content_type)
            .query(query)
            .body(body);
        let builder = self.authorize(builder, service).await?;
        let response = builder
            .send()
            .await
            .map_err(|e| GcpError::from_str(service, &format!("Upload failed: {}", e)))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(GcpError::from_api_response(service, status, &text));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}

// ── Pagination helpers ──────────────────────────────────────────────────

/// Fetch every page of a list call, concatenating the `items_key` arrays.
pub async fn list_all(api: &dyn CloudApi, call: ApiCall, items_key: &str) -> GcpResult<Vec<Value>> {
    let mut items = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let mut page_call = call.clone();
        if let Some(ref token) = page_token {
            page_call = page_call.with_query("pageToken", token.clone());
        }
        let page = api.send(page_call).await?;
        if let Some(found) = page.get(items_key).and_then(|v| v.as_array()) {
            items.extend(found.iter().cloned());
        }
        match page.get("nextPageToken").and_then(|v| v.as_str()) {
            Some(next) if !next.is_empty() => page_token = Some(next.to_string()),
            _ => break,
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use serde_json::json;

    #[test]
    fn base_url_default_and_override() {
        let client = GcpClient::new(
            Credentials::MetadataServer,
            CloudContext::new("p", "l"),
            None,
        );
        assert_eq!(client.base_url("run"), "https://run.googleapis.com");

        let local = GcpClient::new(
            Credentials::MetadataServer,
            CloudContext::new("p", "l"),
            Some("http://localhost:9000/".into()),
        );
        assert_eq!(local.base_url("run"), "http://localhost:9000");
    }

    #[tokio::test]
    async fn list_all_follows_page_tokens() {
        let cloud = FakeCloud::new("p", "l");
        cloud.once(
            HttpMethod::Get,
            "v1/projects/p/subscriptions",
            json!({"subscriptions": [{"name": "a"}], "nextPageToken": "tok"}),
        );
        cloud.on(
            HttpMethod::Get,
            "v1/projects/p/subscriptions",
            json!({"subscriptions": [{"name": "b"}]}),
        );
        let call = ApiCall::new("pubsub", HttpMethod::Get, "v1/projects/p/subscriptions");
        let items = list_all(&cloud, call, "subscriptions").await.unwrap();
        assert_eq!(items.len(), 2);
        let calls = cloud.calls();
        assert_eq!(calls[1].query_value("pageToken"), Some("tok"));
    }
}
