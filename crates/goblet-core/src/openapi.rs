//! Swagger 2.0 documents for API Gateway.
//!
//! Generated from registered routes, or taken from a user document; either
//! way every operation gets an `x-google-backend` pointing at the backend.

use crate::error::{GobletError, GobletResult};
use crate::handlers::RouteEntry;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct OpenApiSpec {
    app_name: String,
    backend_url: String,
    deadline: u64,
    doc: Map<String, Value>,
    paths: Map<String, Value>,
}

impl OpenApiSpec {
    pub fn new(app_name: &str, backend_url: &str, deadline: u64) -> Self {
        let mut doc = Map::new();
        doc.insert("swagger".into(), json!("2.0"));
        doc.insert(
            "info".into(),
            json!({
                "title": app_name,
                "description": "Goblet Autogenerated Spec",
                "version": "1.0.0",
            }),
        );
        doc.insert("schemes".into(), json!(["https"]));
        doc.insert("produces".into(), json!(["application/json"]));
        Self {
            app_name: app_name.to_string(),
            backend_url: backend_url.to_string(),
            deadline,
            doc,
            paths: Map::new(),
        }
    }

    /// Wrap a user-supplied document; API Gateway only accepts swagger 2.0.
    pub fn from_existing(app_name: &str, backend_url: &str, deadline: u64, existing: Value) -> GobletResult<Self> {
        let Value::Object(mut doc) = existing else {
            return Err(GobletError::validation("openapi document must be an object"));
        };
        if doc.get("swagger").and_then(|v| v.as_str()) != Some("2.0") {
            return Err(GobletError::validation("API Gateway only supports swagger 2.0"));
        }
        let paths = match doc.remove("paths") {
            Some(Value::Object(paths)) => paths,
            _ => Map::new(),
        };
        Ok(Self {
            app_name: app_name.to_string(),
            backend_url: backend_url.to_string(),
            deadline,
            doc,
            paths,
        })
    }

    /// `security` defaults to every definition with no scopes.
    pub fn with_security(mut self, definitions: Map<String, Value>, security: Option<Value>) -> Self {
        let security = security.unwrap_or_else(|| {
            Value::Array(definitions.keys().map(|k| json!({ k.clone(): [] })).collect())
        });
        self.doc.insert("securityDefinitions".into(), Value::Object(definitions));
        self.doc.insert("security".into(), security);
        self
    }

    fn backend_block(&self, address: Option<&str>, deadline: Option<u64>) -> Value {
        json!({
            "address": address.unwrap_or(&self.backend_url),
            "protocol": "h2",
            "path_translation": "APPEND_PATH_TO_ADDRESS",
            "deadline": deadline.unwrap_or(self.deadline),
        })
    }

    pub fn add_route(&mut self, entry: &RouteEntry) {
        let opts = &entry.options;
        let mut op = Map::new();
        op.insert(
            "x-google-backend".into(),
            self.backend_block(opts.backend.as_deref(), opts.deadline),
        );
        op.insert(
            "operationId".into(),
            json!(format!("{}_{}", entry.method.to_ascii_lowercase(), entry.function_name)),
        );

        let mut params: Vec<Value> = entry
            .view_args
            .iter()
            .map(|arg| json!({"in": "path", "name": arg, "required": true, "type": entry.param_type(arg)}))
            .collect();
        if let Some(ref schema) = opts.request_body {
            params.push(json!({"in": "body", "name": "requestBody", "schema": schema}));
        }
        let mut consumes = opts.content_types.clone();
        if opts.form_data {
            params.push(json!({"in": "formData", "name": "file", "type": "string"}));
            consumes = vec!["multipart/form-data".into()];
        }
        for query in &opts.query_params {
            let mut query = query.clone();
            if let Value::Object(ref mut q) = query {
                if !q.contains_key("schema") {
                    q.insert("in".into(), json!("query"));
                }
            }
            params.push(query);
        }
        if !params.is_empty() {
            op.insert("parameters".into(), Value::Array(params));
        }

        let responses = match (&opts.responses, &opts.response_schema) {
            (Some(responses), _) => responses.clone(),
            (None, Some(schema)) => json!({"200": {"description": "A successful response", "schema": schema}}),
            (None, None) => json!({"200": {"description": "A successful response"}}),
        };
        op.insert("responses".into(), responses);
        if let Some(ref security) = opts.security {
            op.insert("security".into(), security.clone());
        }
        if !opts.tags.is_empty() {
            op.insert("tags".into(), json!(opts.tags));
        }
        if !consumes.is_empty() {
            op.insert("consumes".into(), json!(consumes));
        }

        let path = self
            .paths
            .entry(entry.path.clone())
            .or_insert_with(|| json!({}));
        if let Value::Object(methods) = path {
            methods.insert(entry.method.to_ascii_lowercase(), Value::Object(op));
        }
    }

    /// Point every operation of the document at the backend.
    pub fn add_x_google_backend(&mut self) {
        let block = self.backend_block(None, None);
        for methods in self.paths.values_mut() {
            if let Value::Object(methods) = methods {
                for op in methods.values_mut() {
                    if let Value::Object(op) = op {
                        op.insert("x-google-backend".into(), block.clone());
                    }
                }
            }
        }
    }

    /// Number of `path × method` operations.
    pub fn operation_count(&self) -> usize {
        self.paths
            .values()
            .filter_map(|m| m.as_object())
            .map(|m| m.len())
            .sum()
    }

    pub fn as_value(&self) -> Value {
        let mut doc = self.doc.clone();
        doc.insert("paths".into(), Value::Object(self.paths.clone()));
        Value::Object(doc)
    }

    pub fn to_yaml(&self) -> GobletResult<String> {
        Ok(serde_yaml::to_string(&self.as_value())?)
    }

    /// Write `{dir}/{app}_openapi_spec.yml`.
    pub fn write(&self, dir: &Path) -> GobletResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_openapi_spec.yml", self.app_name));
        std::fs::write(&path, self.to_yaml()?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{RouteOptions, Routes};
    use crate::request::{Request, Response};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn ok() -> crate::handlers::RouteFn {
        Arc::new(|_: &Request, _: &BTreeMap<String, String>| Response::from("ok"))
    }

    #[test]
    fn test_route_operations() {
        let mut routes = Routes::new("app");
        routes
            .register(
                "get_item",
                "/items/{id}",
                ok(),
                RouteOptions::methods(&["GET", "DELETE"]).with_param_type("id", "integer"),
            )
            .unwrap();
        routes
            .register(
                "create",
                "/items",
                ok(),
                RouteOptions::methods(&["POST"])
                    .with_request_body(json!({"type": "object"}))
                    .with_query_param(json!({"name": "dry", "type": "boolean"}))
                    .with_backend("https://other")
                    .with_deadline(60),
            )
            .unwrap();

        let spec = routes.openapi_spec(&crate::config::GConfig::default(), "https://backend", 15);
        let doc = spec.as_value();
        assert_eq!(spec.operation_count(), 3);
        let get = &doc["paths"]["/items/{id}"]["get"];
        assert_eq!(get["operationId"], "get_get_item");
        assert_eq!(get["parameters"][0]["type"], "integer");
        assert_eq!(get["x-google-backend"]["address"], "https://backend");
        assert_eq!(get["x-google-backend"]["deadline"], 15);

        let post = &doc["paths"]["/items"]["post"];
        assert_eq!(post["x-google-backend"]["address"], "https://other");
        assert_eq!(post["x-google-backend"]["deadline"], 60);
        assert_eq!(post["parameters"][0]["in"], "body");
        assert_eq!(post["parameters"][1]["in"], "query");
        assert!(spec.to_yaml().unwrap().contains("swagger:"));
    }

    #[test]
    fn test_existing_document_round_trip() {
        let mut routes = Routes::new("app");
        routes.register("a", "/a", ok(), RouteOptions::default()).unwrap();
        routes.register("b", "/b/{x}", ok(), RouteOptions::methods(&["PUT"])).unwrap();
        let generated = routes.openapi_spec(&crate::config::GConfig::default(), "https://old", 15);

        let mut reused = OpenApiSpec::from_existing("app", "https://new", 20, generated.as_value()).unwrap();
        reused.add_x_google_backend();
        let doc = reused.as_value();
        assert_eq!(reused.operation_count(), 2);
        assert_eq!(doc["paths"]["/b/{x}"]["put"]["x-google-backend"]["address"], "https://new");

        assert!(OpenApiSpec::from_existing("app", "u", 15, json!({"openapi": "3.0.0"})).is_err());
    }

    #[test]
    fn test_security_defaults() {
        let mut defs = Map::new();
        defs.insert("api_key".into(), json!({"type": "apiKey", "name": "key", "in": "query"}));
        let spec = OpenApiSpec::new("app", "u", 15).with_security(defs, None);
        assert_eq!(spec.as_value()["security"], json!([{"api_key": []}]));
    }
}
