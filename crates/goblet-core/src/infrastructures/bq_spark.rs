//! BigQuery Spark stored procedures backed by a `spark` connection. Local
//! Spark files are uploaded to bucket `{project}-{app}` first.

use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, Infrastructure, Resource};
use async_trait::async_trait;
use goblet_gcp::{StorageClient, Verb};
use log::{debug, info};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparkProcedureOptions {
    pub dataset_id: String,
    pub runtime_version: String,
    /// Local file uploaded as `mainFileUri`.
    pub spark_file: Option<String>,
    /// Inline PySpark code used as `definitionBody`.
    pub definition_body: Option<String>,
    pub container_image: Option<String>,
    pub additional_python_files: Vec<String>,
    pub additional_files: Vec<String>,
    pub properties: Map<String, Value>,
    /// Connection location; defaults to the deploy location.
    pub location: Option<String>,
}

impl SparkProcedureOptions {
    pub fn from_file(dataset_id: &str, runtime_version: &str, spark_file: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            runtime_version: runtime_version.to_string(),
            spark_file: Some(spark_file.to_string()),
            ..Self::default()
        }
    }

    pub fn inline(dataset_id: &str, runtime_version: &str, code: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            runtime_version: runtime_version.to_string(),
            definition_body: Some(code.to_string()),
            ..Self::default()
        }
    }

    /// Values from the `bqsparkstoredprocedure` config section win.
    fn with_config(mut self, config: &Map<String, Value>) -> Self {
        let text = |key: &str| config.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let list = |key: &str| {
            config.get(key).and_then(|v| v.as_array()).map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
        };
        if let Some(v) = text("dataset_id") {
            self.dataset_id = v;
        }
        if let Some(v) = text("runtime_version") {
            self.runtime_version = v;
        }
        if let Some(v) = text("spark_file") {
            self.spark_file = Some(v);
        }
        if let Some(v) = text("container_image") {
            self.container_image = Some(v);
        }
        if let Some(v) = text("location") {
            self.location = Some(v);
        }
        if let Some(v) = list("additional_python_files") {
            self.additional_python_files = v;
        }
        if let Some(v) = list("additional_files") {
            self.additional_files = v;
        }
        if let Some(Value::Object(p)) = config.get("properties") {
            self.properties = p.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BqSparkStoredProcedure {
    name: String,
    resources: BTreeMap<String, SparkProcedureOptions>,
}

impl BqSparkStoredProcedure {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// Register a procedure; `config` is the `bqsparkstoredprocedure`
    /// section. Returns the routine id.
    pub fn register(
        &mut self,
        name: &str,
        options: SparkProcedureOptions,
        config: &Map<String, Value>,
    ) -> GobletResult<String> {
        let routine = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(name)
            .replace('-', "_");
        let options = options.with_config(config);
        if options.spark_file.is_some() == options.definition_body.is_some() {
            return Err(GobletError::validation(format!(
                "spark procedure {} needs exactly one of spark_file or inline code",
                routine
            )));
        }
        self.resources.insert(routine.clone(), options);
        Ok(routine)
    }

    pub fn merge(&mut self, other: &BqSparkStoredProcedure) {
        self.resources.extend(other.resources.clone());
    }

    pub fn bucket_name(&self, project: &str) -> String {
        format!("{}-{}", project, self.name)
    }

    fn location<'a>(&'a self, ctx: &DeployContext<'a>, options: &'a SparkProcedureOptions) -> &'a str {
        options.location.as_deref().unwrap_or_else(|| ctx.location())
    }

    fn connection_path(&self, location: &str) -> String {
        format!("projects/{{project_id}}/locations/{}/connections/{}", location, self.name)
    }

    /// The routine body. `uris` maps local files to their uploaded
    /// `gs://` location.
    pub fn routine_body(
        &self,
        ctx: &DeployContext<'_>,
        routine: &str,
        options: &SparkProcedureOptions,
        uris: &BTreeMap<String, String>,
    ) -> Value {
        let uri = |file: &String| uris.get(file).cloned().unwrap_or_else(|| file.clone());
        let mut spark = Map::new();
        spark.insert(
            "connection".into(),
            json!(ctx.render(&self.connection_path(self.location(ctx, options)))),
        );
        spark.insert("runtimeVersion".into(), json!(options.runtime_version));
        spark.insert("containerImage".into(), json!(options.container_image));
        spark.insert("properties".into(), Value::Object(options.properties.clone()));
        if let Some(ref file) = options.spark_file {
            spark.insert("mainFileUri".into(), json!(uri(file)));
        }
        if !options.additional_python_files.is_empty() {
            spark.insert(
                "pyFileUris".into(),
                json!(options.additional_python_files.iter().map(uri).collect::<Vec<_>>()),
            );
        }
        if !options.additional_files.is_empty() {
            spark.insert(
                "archiveUris".into(),
                json!(options.additional_files.iter().map(uri).collect::<Vec<_>>()),
            );
        }
        let mut body = json!({
            "language": "PYTHON",
            "routineReference": {
                "projectId": ctx.project(),
                "datasetId": options.dataset_id,
                "routineId": routine,
            },
            "routineType": "PROCEDURE",
            "sparkOptions": spark,
        });
        if let Some(ref code) = options.definition_body {
            body["definitionBody"] = json!(code);
        }
        debug!(target: "goblet::deployer", "Routine payload {}", body);
        body
    }

    async fn deploy_connection(&self, ctx: &DeployContext<'_>, location: &str) -> GobletResult<()> {
        let parent = format!("projects/{{project_id}}/locations/{}", location);
        match ctx
            .clients
            .bigquery_connections()
            .execute(
                ctx.api,
                Verb::Create,
                Some(&parent),
                Some(json!({"spark": {}})),
                &[("connectionId", self.name.as_str())],
            )
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => info!(target: "goblet::deployer", "Created bigquery connection name: {}", self.name),
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "Connection already created bigquery query: for {}", self.name)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Upload every local file of `options`; returns local → `gs://`.
    async fn upload_files(
        &self,
        ctx: &DeployContext<'_>,
        bucket: &str,
        options: &SparkProcedureOptions,
    ) -> GobletResult<BTreeMap<String, String>> {
        let mut uris = BTreeMap::new();
        let files = options
            .spark_file
            .iter()
            .chain(&options.additional_python_files)
            .chain(&options.additional_files);
        for file in files {
            let local = ctx.root.join(file);
            let data = tokio::fs::read(&local).await?;
            let object = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            let uri = StorageClient::upload_object(ctx.api, bucket, &object, "text/x-python", data).await?;
            info!(target: "goblet::deployer", "uploaded file {} to bucket {}", file, bucket);
            uris.insert(file.clone(), uri);
        }
        Ok(uris)
    }
}

#[async_trait]
impl Resource for BqSparkStoredProcedure {
    fn resource_type(&self) -> &'static str {
        "bqsparkstoredprocedure"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["bigquery", "bigqueryconnection"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = vec![
            "bigquery.jobs.create".to_string(),
            "bigquery.connections.delegate".to_string(),
            "bigquery.connections.use".to_string(),
        ];
        for (service, resource) in [
            ("storage", "objects"),
            ("storage", "buckets"),
            ("bigquery", "connections"),
            ("bigquery", "routines"),
        ] {
            perms.extend(gcp_generic_resource_permissions(service, resource));
        }
        perms
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        info!(target: "goblet::deployer", "Deploying bigquery spark stored procedures");
        let locations: BTreeSet<&str> = self.resources.values().map(|o| self.location(ctx, o)).collect();
        for location in locations {
            self.deploy_connection(ctx, location).await?;
        }

        let bucket = self.bucket_name(ctx.project());
        let routines = ctx.clients.bigquery_routines();
        for (routine, options) in &self.resources {
            let uris = if options.spark_file.is_some() {
                StorageClient::create_bucket(ctx.api, &bucket, ctx.location()).await?;
                self.upload_files(ctx, &bucket, options).await?
            } else {
                BTreeMap::new()
            };
            let body = self.routine_body(ctx, routine, options, &uris);
            let dataset = format!("projects/{{project_id}}/datasets/{}", options.dataset_id);
            match routines
                .execute(ctx.api, Verb::Create, Some(&dataset), Some(body.clone()), &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(target: "goblet::deployer", "Created bq routine {}", routine),
                Err(e) if e.is_already_exists() => {
                    let path = format!("{}/routines/{}", dataset, routine);
                    routines.execute(ctx.api, Verb::Update, Some(&path), Some(body), &[]).await?;
                    info!(target: "goblet::deployer", "Updated Spark Stored Procedure {}", routine);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Connection, then each routine, then the upload bucket.
    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let locations: BTreeSet<&str> = self.resources.values().map(|o| self.location(ctx, o)).collect();
        for location in locations {
            match ctx
                .clients
                .bigquery_connections()
                .execute(ctx.api, Verb::Delete, Some(&self.connection_path(location)), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!(target: "goblet::deployer", "Connection {} already destroyed", self.name)
                }
                Err(e) => return Err(e),
            }
        }
        for (routine, options) in &self.resources {
            let path = format!(
                "projects/{{project_id}}/datasets/{}/routines/{}",
                options.dataset_id, routine
            );
            match ctx
                .clients
                .bigquery_routines()
                .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(
                    target: "goblet::deployer",
                    "Destroyed routine {} for dataset {}", routine, options.dataset_id
                ),
                Err(e) if e.is_not_found() || e.is_already_exists() => {
                    info!(target: "goblet::deployer", "Routine {} already destroyed", routine)
                }
                Err(e) => return Err(e),
            }
        }
        StorageClient::delete_bucket_force(ctx.api, &self.bucket_name(ctx.project())).await?;
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for BqSparkStoredProcedure {}
