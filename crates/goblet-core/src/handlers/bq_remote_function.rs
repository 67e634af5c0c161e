//! BigQuery remote functions: a SQL routine whose calls BigQuery batches and
//! posts to the backend through a `cloudResource` connection.

use super::BqFn;
use crate::config::GConfig;
use crate::dispatch::HEADER_NAME;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use async_trait::async_trait;
use goblet_gcp::Verb;
use log::info;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// SQL types a remote function may take or return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BqParamType {
    Bool,
    String,
    Int64,
    Float64,
    Json,
}

impl BqParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BqParamType::Bool => "BOOL",
            BqParamType::String => "STRING",
            BqParamType::Int64 => "INT64",
            BqParamType::Float64 => "FLOAT64",
            BqParamType::Json => "JSON",
        }
    }

    /// Map a declared parameter type (`bool`, `string`, `int`, `float`,
    /// `list`, `dict`) to its SQL type.
    pub fn from_declared(declared: &str) -> GobletResult<Self> {
        match declared {
            "bool" => Ok(BqParamType::Bool),
            "str" | "string" => Ok(BqParamType::String),
            "int" => Ok(BqParamType::Int64),
            "float" => Ok(BqParamType::Float64),
            "list" | "dict" => Ok(BqParamType::Json),
            other => Err(GobletError::validation(format!(
                "{} is not a supported remote function type",
                other
            ))),
        }
    }
}

impl fmt::Display for BqParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutineOptions {
    pub dataset_id: String,
    pub inputs: Vec<(String, BqParamType)>,
    pub output: BqParamType,
    /// The function receives one column per argument instead of one row.
    pub vectorized: bool,
    pub max_batching_rows: Option<u32>,
    /// Connection location; defaults to the deploy location.
    pub location: Option<String>,
}

impl RoutineOptions {
    pub fn new(dataset_id: &str, output: BqParamType) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            inputs: Vec::new(),
            output,
            vectorized: false,
            max_batching_rows: None,
            location: None,
        }
    }

    pub fn arg(mut self, name: &str, kind: BqParamType) -> Self {
        self.inputs.push((name.to_string(), kind));
        self
    }

    pub fn vectorized(mut self) -> Self {
        self.vectorized = true;
        self
    }

    pub fn with_max_batching_rows(mut self, rows: u32) -> Self {
        self.max_batching_rows = Some(rows);
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }
}

#[derive(Clone)]
struct Routine {
    options: RoutineOptions,
    function: BqFn,
}

pub struct BqRemoteFunction {
    name: String,
    resources: BTreeMap<String, Routine>,
    service_accounts: Vec<String>,
}

/// Rows to columns. Short rows leave their missing cells out.
pub fn transpose(rows: &[Value]) -> Vec<Value> {
    let width = rows
        .iter()
        .filter_map(|r| r.as_array())
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    (0..width)
        .map(|i| {
            Value::Array(
                rows.iter()
                    .filter_map(|r| r.as_array().and_then(|cells| cells.get(i)).cloned())
                    .collect(),
            )
        })
        .collect()
}

impl BqRemoteFunction {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
            service_accounts: Vec::new(),
        }
    }

    /// Register routine `{app}_{name}`; routine ids only allow underscores.
    pub fn register(&mut self, name: &str, function: BqFn, options: RoutineOptions) -> String {
        let routine = format!("{}_{}", self.name, name).replace('-', "_");
        self.resources.insert(routine.clone(), Routine { options, function });
        routine
    }

    pub fn merge(&mut self, other: &BqRemoteFunction) {
        self.resources.extend(other.resources.clone());
    }

    fn locations<'a>(&'a self, ctx: &DeployContext<'a>) -> BTreeSet<&'a str> {
        self.resources
            .values()
            .map(|r| r.options.location.as_deref().unwrap_or_else(|| ctx.location()))
            .collect()
    }

    fn connection_path(&self, location: &str) -> String {
        format!("projects/{{project_id}}/locations/{}/connections/{}", location, self.name)
    }

    /// Create the connection (or fetch the existing one) and return it.
    async fn deploy_connection(&self, ctx: &DeployContext<'_>, location: &str) -> GobletResult<Value> {
        let connections = ctx.clients.bigquery_connections();
        let parent = format!("projects/{{project_id}}/locations/{}", location);
        match connections
            .execute(
                ctx.api,
                Verb::Create,
                Some(&parent),
                Some(json!({"cloudResource": {}})),
                &[("connectionId", self.name.as_str())],
            )
            .await
            .map_err(GobletError::from)
        {
            Ok(connection) => {
                info!(target: "goblet::deployer", "Created bigquery connection name: {}", self.name);
                Ok(connection)
            }
            Err(e) if e.is_already_exists() => {
                info!(
                    target: "goblet::deployer",
                    "Bigquery connection already exist with name: {} and location {}", self.name, location
                );
                Ok(connections
                    .execute(ctx.api, Verb::Get, Some(&self.connection_path(location)), None, &[])
                    .await?)
            }
            Err(e) => Err(e),
        }
    }

    /// The routine resource for `routine_id`.
    pub fn routine_body(&self, ctx: &DeployContext<'_>, routine_id: &str, endpoint: &str) -> GobletResult<Value> {
        let routine = self
            .resources
            .get(routine_id)
            .ok_or_else(|| GobletError::NotFound(format!("Method {} not found", routine_id)))?;
        let opts = &routine.options;
        let location = opts.location.as_deref().unwrap_or_else(|| ctx.location());
        let arguments: Vec<Value> = opts
            .inputs
            .iter()
            .map(|(name, kind)| json!({"name": name, "dataType": {"typeKind": kind.as_str()}}))
            .collect();
        let mut remote = json!({
            "endpoint": endpoint,
            "connection": ctx.render(&self.connection_path(location)),
            "userDefinedContext": { HEADER_NAME: routine_id },
        });
        if let Some(rows) = opts.max_batching_rows {
            remote["maxBatchingRows"] = json!(rows.to_string());
        }
        Ok(json!({
            "language": "SQL",
            "routineReference": {
                "projectId": ctx.project(),
                "datasetId": opts.dataset_id,
                "routineId": routine_id,
            },
            "routineType": "SCALAR_FUNCTION",
            "arguments": arguments,
            "returnType": {"typeKind": opts.output.as_str()},
            "remoteFunctionOptions": remote,
        }))
    }

    async fn deploy_routine(&self, ctx: &DeployContext<'_>, routine_id: &str, dataset: &str, body: Value) -> GobletResult<()> {
        let routines = ctx.clients.bigquery_routines();
        let dataset_path = format!("projects/{{project_id}}/datasets/{}", dataset);
        match routines
            .execute(ctx.api, Verb::Create, Some(&dataset_path), Some(body.clone()), &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "Created bq routine {}", routine_id);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let path = format!("{}/routines/{}", dataset_path, routine_id);
                routines.execute(ctx.api, Verb::Update, Some(&path), Some(body), &[]).await?;
                info!(target: "goblet::deployer", "Updated remote function {}", routine_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Resource for BqRemoteFunction {
    fn resource_type(&self) -> &'static str {
        "bqremotefunction"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["bigquery", "bigqueryconnection"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = vec![
            "bigquery.connections.create".to_string(),
            "bigquery.connections.get".to_string(),
            "bigquery.connections.delete".to_string(),
        ];
        perms.extend(gcp_generic_resource_permissions("bigquery", "routines"));
        perms
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        info!(target: "goblet::deployer", "Deploying bigquery remote functions");
        let mut accounts = Vec::new();
        for location in self.locations(ctx) {
            let connection = self.deploy_connection(ctx, location).await?;
            if let Some(sa) = connection
                .get("cloudResource")
                .and_then(|c| c.get("serviceAccountId"))
                .and_then(|v| v.as_str())
            {
                accounts.push(sa.to_string());
            }
        }

        let endpoint = ctx.backend()?.http_endpoint(ctx).await?;
        for (routine_id, routine) in &self.resources {
            let body = self.routine_body(ctx, routine_id, &endpoint)?;
            self.deploy_routine(ctx, routine_id, &routine.options.dataset_id, body).await?;
        }
        self.service_accounts = accounts;
        Ok(())
    }

    /// Connections first, then every routine.
    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let connections = ctx.clients.bigquery_connections();
        for location in self.locations(ctx) {
            match connections
                .execute(ctx.api, Verb::Delete, Some(&self.connection_path(location)), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(target: "goblet::deployer", "Destroyed connection {} in {}", self.name, location),
                Err(e) if e.is_not_found() => {
                    info!(target: "goblet::deployer", "Connection {} already destroyed", self.name)
                }
                Err(e) => return Err(e),
            }
        }
        let routines = ctx.clients.bigquery_routines();
        for (routine_id, routine) in &self.resources {
            let path = format!(
                "projects/{{project_id}}/datasets/{}/routines/{}",
                routine.options.dataset_id, routine_id
            );
            match routines
                .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(
                    target: "goblet::deployer",
                    "Destroyed routine {} for dataset {}", routine_id, routine.options.dataset_id
                ),
                Err(e) if e.is_not_found() || e.is_already_exists() => {
                    info!(target: "goblet::deployer", "Routine {} already destroyed", routine_id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Handler for BqRemoteFunction {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let body = request
            .json_object()
            .ok_or_else(|| GobletError::validation("remote function call without a JSON body"))?;
        let name = body
            .get("userDefinedContext")
            .and_then(|c| c.get(HEADER_NAME))
            .and_then(|v| v.as_str())
            .ok_or_else(|| GobletError::validation("No X-Goblet-Name header found"))?;
        let routine = self
            .resources
            .get(name)
            .ok_or_else(|| GobletError::NotFound(format!("Method {} not found", name)))?;
        let calls: &[Value] = body
            .get("calls")
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let replies = if routine.options.vectorized {
            match (routine.function)(&transpose(calls)) {
                Value::Array(replies) => replies,
                single => vec![single],
            }
        } else {
            calls
                .iter()
                .map(|row| {
                    let args = row.as_array().map(Vec::as_slice).unwrap_or_default();
                    (routine.function)(args)
                })
                .collect()
        };
        Ok(Response::jsonify(json!({ "replies": replies })))
    }

    /// Connection identities must be able to invoke the backend.
    fn service_accounts(&self, _config: &GConfig) -> Vec<String> {
        self.service_accounts
            .iter()
            .map(|sa| format!("serviceAccount:{}", sa))
            .collect()
    }
}
