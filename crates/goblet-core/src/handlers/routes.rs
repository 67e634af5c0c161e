//! HTTP routes served through API Gateway (or directly by Cloud Run).

use super::RouteFn;
use crate::backends::BackendKind;
use crate::config::{goblet_dir, GConfig};
use crate::error::{GobletError, GobletResult};
use crate::infrastructures::apigateway::{deploy_apigateway, destroy_apigateway};
use crate::openapi::OpenApiSpec;
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::hyphenate;
use async_trait::async_trait;
use log::info;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How routes reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutesType {
    #[default]
    ApiGateway,
    /// Cloud Run serves every path itself; no gateway is deployed.
    CloudRun,
}

// ── CORS ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<u64>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".into(),
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            max_age: None,
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    const REQUIRED_HEADERS: [&'static str; 2] = ["Authorization", "Content-Type"];

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.allow_origin = origin.to_string();
        self
    }

    pub fn with_allow_headers(mut self, headers: &[&str]) -> Self {
        self.allow_headers = headers.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_expose_headers(mut self, headers: &[&str]) -> Self {
        self.expose_headers = headers.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_credentials(mut self) -> Self {
        self.allow_credentials = true;
        self
    }

    /// Sorted union of the configured and required headers.
    pub fn allow_headers_value(&self) -> String {
        let mut headers: Vec<&str> = self
            .allow_headers
            .iter()
            .map(String::as_str)
            .chain(Self::REQUIRED_HEADERS)
            .collect();
        headers.sort_unstable();
        headers.dedup();
        headers.join(",")
    }

    pub fn access_control_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Access-Control-Allow-Origin".into(), self.allow_origin.clone());
        headers.insert("Access-Control-Allow-Headers".into(), self.allow_headers_value());
        if !self.expose_headers.is_empty() {
            headers.insert("Access-Control-Expose-Headers".into(), self.expose_headers.join(","));
        }
        if let Some(age) = self.max_age {
            headers.insert("Access-Control-Max-Age".into(), age.to_string());
        }
        if self.allow_credentials {
            headers.insert("Access-Control-Allow-Credentials".into(), "true".into());
        }
        headers
    }

    /// Headers returned by the generated `OPTIONS` handler.
    pub fn preflight_headers(&self, methods: &[String]) -> BTreeMap<String, String> {
        let mut headers = self.access_control_headers();
        let mut methods = methods.to_vec();
        methods.sort();
        headers.insert("Access-Control-Allow-Methods".into(), methods.join(","));
        headers
    }
}

// ── Route Entries ───────────────────────────────────────────────────────

/// Per-route options; every field is optional.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub methods: Vec<String>,
    pub cors: Option<CorsConfig>,
    /// Swagger schema of the JSON body.
    pub request_body: Option<Value>,
    pub query_params: Vec<Value>,
    pub form_data: bool,
    pub responses: Option<Value>,
    /// Swagger schema of a successful response.
    pub response_schema: Option<Value>,
    pub security: Option<Value>,
    pub tags: Vec<String>,
    pub content_types: Vec<String>,
    /// Backend address override for this route.
    pub backend: Option<String>,
    pub deadline: Option<u64>,
    /// Swagger primitive per path placeholder; `string` when absent.
    pub param_types: BTreeMap<String, String>,
}

impl RouteOptions {
    pub fn methods(methods: &[&str]) -> Self {
        Self {
            methods: methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            ..Default::default()
        }
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    pub fn with_request_body(mut self, schema: Value) -> Self {
        self.request_body = Some(schema);
        self
    }

    pub fn with_query_param(mut self, param: Value) -> Self {
        self.query_params.push(param);
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_responses(mut self, responses: Value) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn with_security(mut self, security: Value) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_backend(mut self, address: &str) -> Self {
        self.backend = Some(address.to_string());
        self
    }

    pub fn with_deadline(mut self, seconds: u64) -> Self {
        self.deadline = Some(seconds);
        self
    }

    pub fn with_param_type(mut self, param: &str, swagger_type: &str) -> Self {
        self.param_types.insert(param.to_string(), swagger_type.to_string());
        self
    }
}

#[derive(Clone)]
pub struct RouteEntry {
    pub function_name: String,
    pub path: String,
    pub method: String,
    pub view_args: Vec<String>,
    pub options: RouteOptions,
    function: RouteFn,
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("function_name", &self.function_name)
            .field("path", &self.path)
            .field("method", &self.method)
            .finish()
    }
}

impl RouteEntry {
    fn new(function: RouteFn, function_name: &str, path: &str, method: &str, options: RouteOptions) -> Self {
        Self {
            function_name: function_name.to_string(),
            path: path.to_string(),
            method: method.to_string(),
            view_args: parse_view_args(path),
            options,
            function,
        }
    }

    /// Swagger type of a path placeholder.
    pub fn param_type(&self, param: &str) -> &str {
        self.options
            .param_types
            .get(param)
            .map(String::as_str)
            .unwrap_or("string")
    }

    /// Placeholder values taken from a concrete request path.
    pub fn extract_view_args(&self, path: &str) -> BTreeMap<String, String> {
        self.path
            .split('/')
            .zip(path.split('/'))
            .filter_map(|(template, actual)| placeholder(template).map(|p| (p.to_string(), actual.to_string())))
            .collect()
    }

    fn call(&self, request: &Request) -> Response {
        let args = self.extract_view_args(&request.path);
        let mut response = (self.function)(request, &args);
        if let Some(ref cors) = self.options.cors {
            response.headers.extend(cors.access_control_headers());
        }
        response
    }
}

fn placeholder(segment: &str) -> Option<&str> {
    segment.strip_prefix('{').and_then(|s| s.strip_suffix('}'))
}

/// `/foo/{bar}/{baz}` → `["bar", "baz"]`.
fn parse_view_args(path: &str) -> Vec<String> {
    path.split('/').filter_map(placeholder).map(str::to_string).collect()
}

/// A `{…}` template segment matches any non-empty, slash-free segment.
pub fn template_matches(template: &str, path: &str) -> bool {
    let template: Vec<&str> = template.split('/').collect();
    let actual: Vec<&str> = path.split('/').collect();
    template.len() == actual.len()
        && template.iter().zip(&actual).all(|(t, a)| match placeholder(t) {
            Some(_) => !a.is_empty(),
            None => t == a,
        })
}

// ── Routes Handler ──────────────────────────────────────────────────────

pub struct Routes {
    name: String,
    /// Registration-ordered `path → method → entry`.
    resources: Vec<(String, BTreeMap<String, RouteEntry>)>,
    cors: Option<CorsConfig>,
    routes_type: RoutesType,
}

impl Routes {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: hyphenate(app_name),
            resources: Vec::new(),
            cors: None,
            routes_type: RoutesType::default(),
        }
    }

    /// Default CORS applied to routes that do not set their own.
    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    pub fn with_routes_type(mut self, routes_type: RoutesType) -> Self {
        self.routes_type = routes_type;
        self
    }

    pub fn routes_type(&self) -> RoutesType {
        self.routes_type
    }

    fn path_entries(&self, path: &str) -> Option<&BTreeMap<String, RouteEntry>> {
        self.resources.iter().find(|(p, _)| p == path).map(|(_, m)| m)
    }

    pub fn register(&mut self, name: &str, path: &str, function: RouteFn, mut options: RouteOptions) -> GobletResult<()> {
        if options.methods.is_empty() {
            options.methods.push("GET".into());
        }
        if options.cors.is_none() {
            options.cors = self.cors.clone();
        }
        if options.cors.is_some() && options.methods.iter().any(|m| m == "OPTIONS") {
            return Err(GobletError::validation(
                "Route entry cannot have both cors and OPTIONS in its methods",
            ));
        }
        let existing = self.path_entries(path);
        for method in &options.methods {
            if let Some(entry) = existing.and_then(|m| m.get(method)) {
                return Err(GobletError::validation(format!(
                    "Duplicate method: '{}' detected for route: '{}' between view functions: \"{}\" and \"{}\". \
                     A specific method may only be specified once for a particular path.",
                    method, path, entry.function_name, name
                )));
            }
        }

        let mut entries = BTreeMap::new();
        for method in &options.methods {
            entries.insert(
                method.clone(),
                RouteEntry::new(function.clone(), name, path, method, options.clone()),
            );
        }
        if let Some(ref cors) = options.cors {
            // preflight answers for every method on the path, not just this registration
            let mut allowed: Vec<String> = existing
                .map(|m| m.keys().filter(|k| *k != "OPTIONS").cloned().collect())
                .unwrap_or_default();
            for method in &options.methods {
                if !allowed.contains(method) {
                    allowed.push(method.clone());
                }
            }
            let preflight = cors.preflight_headers(&allowed);
            let options_fn: RouteFn = Arc::new(move |_: &Request, _: &BTreeMap<String, String>| {
                let mut response = Response::from("success");
                response.headers.extend(preflight.clone());
                response
            });
            entries.insert(
                "OPTIONS".into(),
                RouteEntry::new(options_fn, name, path, "OPTIONS", options.clone()),
            );
        }

        match self.resources.iter_mut().find(|(p, _)| p == path) {
            Some((_, current)) => current.extend(entries),
            None => self.resources.push((path.to_string(), entries)),
        }
        Ok(())
    }

    /// Literal path first, then the first matching template.
    pub fn resolve(&self, method: &str, path: &str) -> Option<&RouteEntry> {
        if let Some(entry) = self.path_entries(path).and_then(|m| m.get(method)) {
            return Some(entry);
        }
        self.resources
            .iter()
            .filter(|(p, _)| p.contains('{') && template_matches(p, path))
            .find_map(|(_, m)| m.get(method))
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.resources.iter().flat_map(|(_, m)| m.values())
    }

    /// Union another app's routes; duplicate `(path, method)` is an error.
    pub fn merge(&mut self, other: &Routes) -> GobletResult<()> {
        for (path, methods) in &other.resources {
            for (method, entry) in methods {
                if let Some(existing) = self.path_entries(path).and_then(|m| m.get(method)) {
                    return Err(GobletError::validation(format!(
                        "Duplicate method: '{}' detected for route: '{}' between view functions: \"{}\" and \"{}\".",
                        method, path, existing.function_name, entry.function_name
                    )));
                }
            }
            match self.resources.iter_mut().find(|(p, _)| p == path) {
                Some((_, current)) => current.extend(methods.clone()),
                None => self.resources.push((path.clone(), methods.clone())),
            }
        }
        Ok(())
    }

    /// Gateway deadline: `api_gateway.deadline`, else the backend timeout, else 15.
    pub fn deadline(config: &GConfig, backend_timeout: Option<u64>) -> u64 {
        config
            .get_path(&["api_gateway", "deadline"])
            .and_then(|v| v.as_u64())
            .or(backend_timeout)
            .unwrap_or(15)
    }

    /// The swagger document for every registered route.
    pub fn openapi_spec(&self, config: &GConfig, backend_url: &str, deadline: u64) -> OpenApiSpec {
        let mut spec = OpenApiSpec::new(&self.name, backend_url, deadline);
        if let Some(Value::Object(definitions)) = config.get("securityDefinitions") {
            spec = spec.with_security(definitions.clone(), config.get("security").cloned());
        }
        for entry in self.entries() {
            spec.add_route(entry);
        }
        spec
    }
}

#[async_trait]
impl Resource for Routes {
    fn resource_type(&self) -> &'static str {
        "routes"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        match self.routes_type {
            RoutesType::ApiGateway => vec!["apigateway"],
            RoutesType::CloudRun => Vec::new(),
        }
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = vec!["apigateway.operations.get".to_string()];
        perms.extend(gcp_generic_resource_permissions("apigateway", "apiconfigs"));
        perms.extend(gcp_generic_resource_permissions("apigateway", "apis"));
        perms.extend(gcp_generic_resource_permissions("apigateway", "gateways"));
        perms
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        if self.routes_type != RoutesType::ApiGateway
            && ctx.backend_kind == BackendKind::CloudFunction
        {
            return Err(GobletError::validation(
                "Cloudfunctions v1 backend is not supported for routes_type cloudrun",
            ));
        }
        if self.routes_type != RoutesType::ApiGateway {
            return Ok(());
        }
        info!(target: "goblet::deployer", "deploying api......");
        let backend = ctx.backend()?;
        let backend_url = backend.http_endpoint(ctx).await?;
        let deadline = Self::deadline(ctx.config, backend.timeout_secs());
        let spec = self.openapi_spec(ctx.config, &backend_url, deadline);
        let path = spec.write(&goblet_dir(ctx.root))?;
        deploy_apigateway(ctx, &self.name, &spec.to_yaml()?, &path.to_string_lossy()).await
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        if self.resources.is_empty() || self.routes_type != RoutesType::ApiGateway {
            return Ok(());
        }
        destroy_apigateway(ctx, &self.name).await
    }
}

impl Handler for Routes {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let entry = self.resolve(&request.method, &request.path).ok_or_else(|| {
            GobletError::NotFound(format!("No route found for {} with {}", request.path, request.method))
        })?;
        Ok(entry.call(request))
    }

    fn service_accounts(&self, config: &GConfig) -> Vec<String> {
        config
            .get_path(&["apiConfig", "gatewayServiceAccount"])
            .and_then(|v| v.as_str())
            .map(|sa| vec![sa.to_string()])
            .unwrap_or_default()
    }
}
