//! Versioned REST collections.
//!
//! Google's resource-oriented APIs share a small set of URL shapes, so a
//! collection is described by its service, version, dotted `calls` path
//! (e.g. `projects.locations.functions`) and a default parent schema.
//!
//! | Verb                | Shape                                  |
//! |---------------------|----------------------------------------|
//! | `Create`            | `POST {parent}/{collection}`           |
//! | `List`              | `GET {parent}/{collection}`            |
//! | `Get`               | `GET {name}`                           |
//! | `Patch`             | `PATCH {name}`                         |
//! | `Update` / `Put`    | `PUT {name}`                           |
//! | `Delete`            | `DELETE {name}`                        |
//! | `Custom(m)`         | `POST {name}:{m}`                      |
//! | `CustomGet(m)`      | `GET {name}:{m}`                       |
//! | `CollectionCustom(m)` | `POST {parent}/{collection}:{m}`     |

use crate::api::{ApiCall, CloudApi, HttpMethod};
use crate::config::CloudContext;
use crate::error::GcpResult;
use crate::operation::{wait_for_operation, PollSettings};
use serde_json::Value;
use std::collections::HashMap;

pub const LOCATION_SCHEMA: &str = "projects/{project_id}/locations/{location_id}";
pub const GLOBAL_SCHEMA: &str = "projects/{project_id}/locations/global";
pub const PROJECT_SCHEMA: &str = "projects/{project_id}";

/// Default API version per service.
pub const DEFAULT_CLIENT_VERSIONS: &[(&str, &str)] = &[
    ("cloudfunctions", "v1"),
    ("cloudbuild", "v1"),
    ("run", "v2"),
    ("pubsub", "v1"),
    ("apigateway", "v1"),
    ("cloudscheduler", "v1"),
    ("redis", "v1"),
    ("vpcaccess", "v1"),
    ("bigquery", "v2"),
    ("bigqueryconnection", "v1"),
    ("secretmanager", "v1"),
    ("eventarc", "v1"),
    ("monitoring", "v3"),
    ("logging", "v2"),
    ("cloudtasks", "v2"),
    ("serviceusage", "v1"),
    ("iam", "v1"),
    ("cloudresourcemanager", "v1"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Create,
    List,
    Get,
    Patch,
    Update,
    Put,
    Delete,
    Custom(&'static str),
    CustomGet(&'static str),
    CollectionCustom(&'static str),
}

impl Verb {
    fn http_method(&self) -> HttpMethod {
        match self {
            Verb::Create | Verb::Custom(_) | Verb::CollectionCustom(_) => HttpMethod::Post,
            Verb::List | Verb::Get | Verb::CustomGet(_) => HttpMethod::Get,
            Verb::Patch => HttpMethod::Patch,
            Verb::Update | Verb::Put => HttpMethod::Put,
            Verb::Delete => HttpMethod::Delete,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Verb::Create => "create".into(),
            Verb::List => "list".into(),
            Verb::Get => "get".into(),
            Verb::Patch => "patch".into(),
            Verb::Update => "update".into(),
            Verb::Put => "put".into(),
            Verb::Delete => "delete".into(),
            Verb::Custom(m) | Verb::CustomGet(m) | Verb::CollectionCustom(m) => m.to_string(),
        }
    }
}

/// One REST collection at a pinned API version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub service: &'static str,
    pub version: String,
    pub calls: &'static str,
    pub parent_schema: &'static str,
    /// Path segment before the version (`bigquery/` for BigQuery).
    prefix: &'static str,
}

impl Collection {
    pub fn new(
        service: &'static str,
        version: &str,
        calls: &'static str,
        parent_schema: &'static str,
    ) -> Self {
        Self {
            service,
            version: version.to_string(),
            calls,
            parent_schema,
            prefix: "",
        }
    }

    fn with_prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = prefix;
        self
    }

    /// Collection id, the last segment of `calls`.
    pub fn leaf(&self) -> &'static str {
        self.calls.rsplit('.').next().unwrap_or(self.calls)
    }

    /// `{prefix}{version}` path root.
    pub fn version_path(&self) -> String {
        format!("{}{}", self.prefix, self.version)
    }

    /// The rendered default parent.
    pub fn parent(&self, ctx: &CloudContext) -> String {
        ctx.render(self.parent_schema)
    }

    /// Full resource name of `id` under the default parent.
    pub fn resource_name(&self, ctx: &CloudContext, id: &str) -> String {
        format!("{}/{}/{}", self.parent(ctx), self.leaf(), id)
    }

    /// Build the REST call for `verb` against `parent_schema` (or the default parent).
    pub fn call(
        &self,
        ctx: &CloudContext,
        verb: &Verb,
        parent_schema: Option<&str>,
        body: Option<Value>,
        query: &[(&str, &str)],
    ) -> ApiCall {
        let target = ctx.render(parent_schema.unwrap_or(self.parent_schema));
        let root = self.version_path();
        let join = |rest: &str| {
            if rest.is_empty() {
                root.clone()
            } else {
                format!("{}/{}", root, rest)
            }
        };
        let path = match verb {
            Verb::Create | Verb::List => join(&format!("{}/{}", target, self.leaf())),
            Verb::CollectionCustom(m) => format!("{}:{}", join(&format!("{}/{}", target, self.leaf())), m),
            Verb::Custom(m) | Verb::CustomGet(m) => format!("{}:{}", join(&target), m),
            _ => join(&target),
        };
        let path = path.trim_start_matches('/').to_string();
        let mut call = ApiCall::new(self.service, verb.http_method(), path);
        for (k, v) in query {
            call = call.with_query(k, *v);
        }
        if let Some(body) = body {
            call = call.with_body(body);
        }
        call
    }

    /// Execute a verb. `parent_schema` may contain `{project_id}` / `{location_id}`.
    pub async fn execute(
        &self,
        api: &dyn CloudApi,
        verb: Verb,
        parent_schema: Option<&str>,
        body: Option<Value>,
        query: &[(&str, &str)],
    ) -> GcpResult<Value> {
        let call = self.call(api.context(), &verb, parent_schema, body, query);
        api.send(call)
            .await
            .map_err(|e| e.with_method(&format!("{}.{}", self.calls, verb.label())))
    }

    /// Poll an operation returned by this collection's service.
    pub async fn wait_for_operation(
        &self,
        api: &dyn CloudApi,
        operation: &Value,
        settings: PollSettings,
    ) -> GcpResult<Value> {
        wait_for_operation(api, self.service, &self.version_path(), operation, settings).await
    }
}

/// Factory for every collection the engine touches, pinned to configured versions.
#[derive(Debug, Clone)]
pub struct VersionedClients {
    versions: HashMap<String, String>,
}

impl Default for VersionedClients {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

impl VersionedClients {
    /// Overlay user `client_versions` on the defaults.
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut versions: HashMap<String, String> = DEFAULT_CLIENT_VERSIONS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in overrides {
            versions.insert(k.clone(), v.clone());
        }
        Self { versions }
    }

    pub fn version(&self, service: &str) -> &str {
        self.versions.get(service).map(String::as_str).unwrap_or("v1")
    }

    pub fn with_version(mut self, service: &str, version: &str) -> Self {
        self.versions.insert(service.to_string(), version.to_string());
        self
    }

    fn collection(&self, service: &'static str, calls: &'static str, schema: &'static str) -> Collection {
        Collection::new(service, self.version(service), calls, schema)
    }

    pub fn cloudfunctions(&self) -> Collection {
        self.collection("cloudfunctions", "projects.locations.functions", LOCATION_SCHEMA)
    }

    pub fn cloudbuild(&self) -> Collection {
        self.collection("cloudbuild", "projects.builds", PROJECT_SCHEMA)
    }

    pub fn run(&self) -> Collection {
        self.collection("run", "projects.locations.services", LOCATION_SCHEMA)
    }

    pub fn run_job(&self) -> Collection {
        self.collection("run", "projects.locations.jobs", LOCATION_SCHEMA)
    }

    pub fn pubsub(&self) -> Collection {
        self.collection("pubsub", "projects.subscriptions", PROJECT_SCHEMA)
    }

    pub fn pubsub_topic(&self) -> Collection {
        self.collection("pubsub", "projects.topics", PROJECT_SCHEMA)
    }

    pub fn apigateway(&self) -> Collection {
        self.collection("apigateway", "projects.locations.gateways", LOCATION_SCHEMA)
    }

    pub fn apigateway_api(&self) -> Collection {
        self.collection("apigateway", "projects.locations.apis", GLOBAL_SCHEMA)
    }

    pub fn apigateway_configs(&self) -> Collection {
        self.collection("apigateway", "projects.locations.apis.configs", GLOBAL_SCHEMA)
    }

    pub fn cloudscheduler(&self) -> Collection {
        self.collection("cloudscheduler", "projects.locations.jobs", LOCATION_SCHEMA)
    }

    pub fn eventarc(&self) -> Collection {
        self.collection("eventarc", "projects.locations.triggers", LOCATION_SCHEMA)
    }

    pub fn monitoring_alert(&self) -> Collection {
        self.collection("monitoring", "projects.alertPolicies", PROJECT_SCHEMA)
    }

    pub fn monitoring_uptime(&self) -> Collection {
        self.collection("monitoring", "projects.uptimeCheckConfigs", PROJECT_SCHEMA)
    }

    pub fn logging_metric(&self) -> Collection {
        self.collection("logging", "projects.metrics", PROJECT_SCHEMA)
    }

    pub fn redis(&self) -> Collection {
        self.collection("redis", "projects.locations.instances", LOCATION_SCHEMA)
    }

    pub fn vpcconnector(&self) -> Collection {
        self.collection("vpcaccess", "projects.locations.connectors", LOCATION_SCHEMA)
    }

    pub fn cloudtask_queue(&self) -> Collection {
        self.collection("cloudtasks", "projects.locations.queues", LOCATION_SCHEMA)
    }

    pub fn cloudtask(&self) -> Collection {
        self.collection("cloudtasks", "projects.locations.queues.tasks", LOCATION_SCHEMA)
    }

    pub fn bigquery_routines(&self) -> Collection {
        self.collection("bigquery", "projects.datasets.routines", PROJECT_SCHEMA)
            .with_prefix("bigquery/")
    }

    pub fn bigquery_connections(&self) -> Collection {
        self.collection("bigqueryconnection", "projects.locations.connections", LOCATION_SCHEMA)
    }

    pub fn secretmanager(&self) -> Collection {
        self.collection("secretmanager", "projects.secrets", PROJECT_SCHEMA)
    }

    pub fn service_usage(&self) -> Collection {
        self.collection("serviceusage", "services", PROJECT_SCHEMA)
    }

    pub fn iam_roles(&self) -> Collection {
        self.collection("iam", "projects.roles", PROJECT_SCHEMA)
    }

    pub fn iam_service_accounts(&self) -> Collection {
        self.collection("iam", "projects.serviceAccounts", PROJECT_SCHEMA)
    }

    pub fn resource_manager(&self) -> Collection {
        self.collection("cloudresourcemanager", "projects", PROJECT_SCHEMA)
    }
}

/// Project number from the context, else `projects.get`.
pub async fn default_project_number(
    api: &dyn CloudApi,
    clients: &VersionedClients,
) -> GcpResult<String> {
    if let Some(ref number) = api.context().project_number {
        return Ok(number.clone());
    }
    let resp = clients
        .resource_manager()
        .execute(api, Verb::Get, None, None, &[])
        .await?;
    Ok(match resp.get("projectNumber") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CloudContext {
        CloudContext::new("proj", "us-central1")
    }

    #[test]
    fn defaults_and_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("cloudfunctions".to_string(), "v2".to_string());
        let clients = VersionedClients::new(&overrides);
        assert_eq!(clients.cloudfunctions().version, "v2");
        assert_eq!(clients.run().version, "v2");
        assert_eq!(clients.pubsub().version, "v1");
        assert_eq!(clients.monitoring_alert().version, "v3");
    }

    #[test]
    fn create_and_list_use_collection_path() {
        let functions = VersionedClients::default().cloudfunctions();
        let call = functions.call(&ctx(), &Verb::Create, None, Some(json!({})), &[]);
        assert_eq!(call.method, HttpMethod::Post);
        assert_eq!(call.path, "v1/projects/proj/locations/us-central1/functions");

        let list = functions.call(&ctx(), &Verb::List, None, None, &[]);
        assert_eq!(list.method, HttpMethod::Get);
        assert_eq!(list.path, call.path);
    }

    #[test]
    fn resource_verbs_use_name() {
        let subs = VersionedClients::default().pubsub();
        let name = "projects/{project_id}/subscriptions/app-topic";
        let patch = subs.call(&ctx(), &Verb::Patch, Some(name), None, &[]);
        assert_eq!(patch.method, HttpMethod::Patch);
        assert_eq!(patch.path, "v1/projects/proj/subscriptions/app-topic");

        let policy = subs.call(&ctx(), &Verb::Custom("setIamPolicy"), Some(name), None, &[]);
        assert_eq!(policy.method, HttpMethod::Post);
        assert_eq!(policy.path, "v1/projects/proj/subscriptions/app-topic:setIamPolicy");
    }

    #[test]
    fn collection_custom_verb() {
        let functions = VersionedClients::default().cloudfunctions();
        let call = functions.call(&ctx(), &Verb::CollectionCustom("generateUploadUrl"), None, None, &[]);
        assert_eq!(
            call.path,
            "v1/projects/proj/locations/us-central1/functions:generateUploadUrl"
        );
    }

    #[test]
    fn bigquery_prefix_and_query() {
        let routines = VersionedClients::default().bigquery_routines();
        let call = routines.call(
            &ctx(),
            &Verb::Create,
            Some("projects/{project_id}/datasets/ds"),
            None,
            &[("alt", "json")],
        );
        assert_eq!(call.path, "bigquery/v2/projects/proj/datasets/ds/routines");
        assert_eq!(call.query_value("alt"), Some("json"));
    }

    #[test]
    fn resource_name_helper() {
        let scheduler = VersionedClients::default().cloudscheduler();
        assert_eq!(
            scheduler.resource_name(&ctx(), "app-job"),
            "projects/proj/locations/us-central1/jobs/app-job"
        );
        assert_eq!(scheduler.leaf(), "jobs");
    }
}
