//! Cloud Scheduler jobs calling the backend (or an explicit uri).

use super::NoArgFn;
use crate::cloud_actions::get_cloudfunction;
use crate::config::GConfig;
use crate::dispatch::{HEADER_NAME, HEADER_TYPE};
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::short_name;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goblet_gcp::{iam, list_all, Verb, LOCATION_SCHEMA};
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Prefix of schedules that start Cloud Run jobs.
pub const JOB_SCHEDULE_PREFIX: &str = "schedule-job-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMethod {
    #[default]
    OidcToken,
    OauthToken,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::OidcToken => "oidcToken",
            AuthMethod::OauthToken => "oauthToken",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Defaults to `UTC`.
    pub timezone: Option<String>,
    pub description: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Defaults to `GET`.
    pub http_method: Option<String>,
    pub retry_config: Option<Value>,
    /// Raw request body; sent base64 encoded.
    pub body: Option<String>,
    /// Target instead of the backend endpoint; may contain
    /// `{project_id}` / `{location_id}`.
    pub uri: Option<String>,
    pub attempt_deadline: Option<String>,
    pub auth_method: AuthMethod,
}

impl ScheduleOptions {
    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.http_method = Some(method.to_ascii_uppercase());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    pub fn with_retry_config(mut self, retry: Value) -> Self {
        self.retry_config = Some(retry);
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth_method = auth;
        self
    }
}

#[derive(Clone)]
struct ScheduledJob {
    job_num: u32,
    job: Map<String, Value>,
    auth_method: AuthMethod,
    uri: Option<String>,
    function: Option<NoArgFn>,
}

#[derive(Clone)]
pub struct Scheduler {
    name: String,
    resources: BTreeMap<String, ScheduledJob>,
    service_account: Option<String>,
}

fn job_path(app: &str, name: &str) -> String {
    format!("{}/jobs/{}-{}", LOCATION_SCHEMA, app, name)
}

impl Scheduler {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
            service_account: None,
        }
    }

    /// Schedule `function`. A second schedule of the same function is
    /// stored as `{name}-{n}`. Returns the registered name.
    pub fn register(&mut self, name: &str, schedule: &str, function: NoArgFn, options: ScheduleOptions) -> String {
        self.insert(name, schedule, Some(function), options)
    }

    /// Schedule a call to `options.uri` with no local function.
    pub fn register_target(&mut self, name: &str, schedule: &str, options: ScheduleOptions) -> String {
        self.insert(name, schedule, None, options)
    }

    fn insert(&mut self, name: &str, schedule: &str, function: Option<NoArgFn>, options: ScheduleOptions) -> String {
        let mut job_num = 1;
        let mut key = name.to_string();
        if let Some(existing) = self.resources.get_mut(name) {
            existing.job_num += 1;
            job_num = existing.job_num;
            key = format!("{}-{}", name, job_num);
        }

        let mut headers = Map::new();
        headers.insert(HEADER_TYPE.into(), json!("schedule"));
        headers.insert(HEADER_NAME.into(), json!(key));
        for (k, v) in &options.headers {
            headers.insert(k.clone(), json!(v));
        }
        let mut target = Map::new();
        target.insert("headers".into(), Value::Object(headers));
        target.insert(
            "httpMethod".into(),
            json!(options.http_method.as_deref().unwrap_or("GET")),
        );
        if let Some(ref body) = options.body {
            target.insert("body".into(), json!(STANDARD.encode(body.as_bytes())));
        }

        let mut job = Map::new();
        job.insert("name".into(), json!(job_path(&self.name, &key)));
        job.insert("schedule".into(), json!(schedule));
        job.insert("timeZone".into(), json!(options.timezone.as_deref().unwrap_or("UTC")));
        job.insert(
            "description".into(),
            json!(options.description.as_deref().unwrap_or("Created by goblet")),
        );
        if let Some(retry) = options.retry_config {
            job.insert("retryConfig".into(), retry);
        }
        if let Some(deadline) = options.attempt_deadline {
            job.insert("attemptDeadline".into(), json!(deadline));
        }
        job.insert("httpTarget".into(), Value::Object(target));

        self.resources.insert(
            key.clone(),
            ScheduledJob {
                job_num,
                job,
                auth_method: options.auth_method,
                uri: options.uri,
                function,
            },
        );
        key
    }

    pub fn merge(&mut self, other: &Scheduler) {
        self.resources.extend(other.resources.clone());
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// The stored job body for `name`, before deploy-time fields are added.
    pub fn job(&self, name: &str) -> Option<Value> {
        self.resources.get(name).map(|j| Value::Object(j.job.clone()))
    }

    async fn resolve_service_account(&self, ctx: &DeployContext<'_>) -> GobletResult<String> {
        let configured = ctx
            .config
            .get_path(&["scheduler", "serviceAccount"])
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(sa) = configured {
            return Ok(sa);
        }
        if let Some(sa) = ctx.backend()?.service_account() {
            return Ok(sa);
        }
        if let Some(sa) = ctx.config.get_path(&["job", "serviceAccount"]).and_then(|v| v.as_str()) {
            return Ok(sa.to_string());
        }
        if ctx.backend_kind.is_cloudfunction() {
            let function = get_cloudfunction(ctx, ctx.backend()?.name()).await?;
            let deployed = function.as_ref().and_then(|f| {
                f.get("serviceAccountEmail")
                    .or_else(|| f.get("serviceConfig").and_then(|s| s.get("serviceAccountEmail")))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
            if let Some(sa) = deployed {
                return Ok(sa);
            }
        }
        Err(GobletError::validation(
            "Service account not found. You can set `serviceAccount` field in config.json under `scheduler`",
        ))
    }

    async fn deploy_job(&self, ctx: &DeployContext<'_>, job_name: &str, job: Value) -> GobletResult<()> {
        let scheduler = ctx.clients.cloudscheduler();
        let path = job.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        match scheduler
            .execute(ctx.api, Verb::Create, None, Some(job.clone()), &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "created scheduled job: {} for {}", job_name, self.name);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "updated scheduled job: {} for {}", job_name, self.name);
                scheduler.execute(ctx.api, Verb::Patch, Some(&path), Some(job), &[]).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Let the scheduler identity start the Cloud Run job it targets.
    async fn grant_job_invoker(&self, ctx: &DeployContext<'_>, job_name: &str, service_account: &str) -> GobletResult<()> {
        let triggered = format!(
            "{}-{}",
            self.name,
            job_name.strip_prefix(JOB_SCHEDULE_PREFIX).unwrap_or(job_name)
        );
        info!(target: "goblet::deployer", "setting iam policy for {}", triggered);
        let resource = format!("{}/jobs/{}", LOCATION_SCHEMA, triggered);
        let member = format!("serviceAccount:{}", service_account);
        match iam::add_binding(ctx.api, &ctx.clients.run_job(), &resource, "roles/run.invoker", &member)
            .await
            .map_err(GobletError::from)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_permission_denied() => {
                warn!(target: "goblet::deployer", "unable to set iam policy for {}: {}", triggered, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy_job(&self, ctx: &DeployContext<'_>, job_name: &str) -> GobletResult<()> {
        match ctx
            .clients
            .cloudscheduler()
            .execute(ctx.api, Verb::Delete, Some(&job_path(&self.name, job_name)), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "Destroying scheduled job {}......", job_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "Scheduled job {} already destroyed", job_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Resource for Scheduler {
    fn resource_type(&self) -> &'static str {
        "scheduler"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudscheduler"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("cloudscheduler", "jobs")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn can_sync(&self) -> bool {
        true
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let service_account = self.resolve_service_account(ctx).await?;
        info!(target: "goblet::deployer", "deploying scheduled jobs......");
        let mut endpoint: Option<String> = None;
        for (job_name, scheduled) in &self.resources {
            let target = match scheduled.uri {
                Some(ref uri) => ctx.render(uri),
                None => match endpoint {
                    Some(ref url) => url.clone(),
                    None => {
                        let url = ctx.backend()?.http_endpoint(ctx).await?;
                        endpoint = Some(url.clone());
                        url
                    }
                },
            };
            let mut job = scheduled.job.clone();
            job.insert("name".into(), json!(ctx.render(&job_path(&self.name, job_name))));
            if let Some(Value::Object(http)) = job.get_mut("httpTarget") {
                http.insert("uri".into(), json!(target));
                http.insert(
                    scheduled.auth_method.as_str().into(),
                    json!({"serviceAccountEmail": service_account}),
                );
            }
            self.deploy_job(ctx, job_name, Value::Object(job)).await?;
            if target.contains("jobs/") {
                self.grant_job_invoker(ctx, job_name, &service_account).await?;
            }
        }
        self.service_account = Some(service_account);
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for job_name in self.resources.keys() {
            self.destroy_job(ctx, job_name).await?;
        }
        Ok(())
    }

    async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        let scheduler = ctx.clients.cloudscheduler();
        let call = scheduler.call(ctx.api.context(), &Verb::List, None, None, &[]);
        let marker = format!("jobs/{}-", self.name);
        let prefix = format!("{}-", self.name);
        for job in list_all(ctx.api, call, "jobs").await? {
            let Some(full) = job.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            if !full.contains(&marker) {
                continue;
            }
            let job_name = short_name(full).strip_prefix(&prefix).unwrap_or_default();
            if !self.resources.contains_key(job_name) {
                info!(target: "goblet::deployer", "Detected unused job in GCP {}", full);
                if !dryrun {
                    self.destroy_job(ctx, job_name).await?;
                }
            }
        }
        Ok(())
    }
}

impl Handler for Scheduler {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let name = request
            .header(HEADER_NAME)
            .ok_or_else(|| GobletError::validation("No X-Goblet-Name header found"))?;
        let function = self
            .resources
            .get(name)
            .and_then(|job| job.function.as_ref())
            .ok_or_else(|| GobletError::NotFound(format!("Function {} not found", name)))?;
        Ok(function())
    }

    fn service_accounts(&self, config: &GConfig) -> Vec<String> {
        self.service_account
            .clone()
            .or_else(|| config.get_path(&["scheduler", "serviceAccount"]).and_then(|v| v.as_str()).map(str::to_string))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Backend, BackendKind, CloudRun, GcloudBuilder, StaticSource};
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};
    use std::sync::Arc;

    fn tick() -> NoArgFn {
        Arc::new(|| Response::from("tick"))
    }

    #[test]
    fn test_counter_suffix_and_defaults() {
        let mut s = Scheduler::new("app");
        assert_eq!(s.register("report", "* * * * *", tick(), ScheduleOptions::default()), "report");
        assert_eq!(
            s.register("report", "0 1 * * *", tick(), ScheduleOptions::default().with_body("{\"a\":1}")),
            "report-2"
        );
        let job = s.job("report-2").unwrap();
        assert_eq!(job["name"], "projects/{project_id}/locations/{location_id}/jobs/app-report-2");
        assert_eq!(job["timeZone"], "UTC");
        assert_eq!(job["description"], "Created by goblet");
        assert_eq!(job["httpTarget"]["httpMethod"], "GET");
        assert_eq!(job["httpTarget"]["headers"]["X-Goblet-Name"], "report-2");
        assert_eq!(job["httpTarget"]["body"], STANDARD.encode("{\"a\":1}"));
    }

    #[test]
    fn test_dispatch_by_name() {
        let mut s = Scheduler::new("app");
        s.register("report", "* * * * *", tick(), ScheduleOptions::default());
        let req = Request::get("/").with_header("X-Goblet-Type", "schedule").with_header("X-Goblet-Name", "report");
        assert_eq!(s.dispatch(&req, None).unwrap().body, json!("tick"));
        let req = Request::get("/").with_header("X-Goblet-Name", "nope");
        assert!(matches!(s.dispatch(&req, None), Err(GobletError::NotFound(_))));
        assert!(s.dispatch(&Request::get("/"), None).is_err());
    }

    #[tokio::test]
    async fn test_deploy_on_cloudrun_patches_existing() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(HttpMethod::Get, "services/app", json!({"uri": "https://app-run.a.run.app"}));
        cloud.fail(HttpMethod::Post, "us-central1/jobs", 409);
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"scheduler": {"serviceAccount": "sched@p.iam.gserviceaccount.com"}}));
        let backend = CloudRun::new(
            "app",
            config.clone(),
            Arc::new(StaticSource(vec![])),
            Arc::new(GcloudBuilder::new(std::path::Path::new("."))),
        );
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun)
            .with_backend(&backend as &dyn Backend);

        let mut s = Scheduler::new("app");
        s.register("report", "* * * * *", tick(), ScheduleOptions::default());
        s.deploy(&ctx).await.unwrap();

        let patch = cloud.calls_to(HttpMethod::Patch, "jobs/app-report");
        assert_eq!(patch.len(), 1);
        let body = patch[0].body.clone().unwrap();
        assert_eq!(body["name"], "projects/proj/locations/us-central1/jobs/app-report");
        assert_eq!(body["httpTarget"]["uri"], "https://app-run.a.run.app");
        assert_eq!(
            body["httpTarget"]["oidcToken"]["serviceAccountEmail"],
            "sched@p.iam.gserviceaccount.com"
        );
        assert_eq!(s.service_accounts(&config), vec!["sched@p.iam.gserviceaccount.com".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_ignores_foreign_jobs() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "locations/us-central1/jobs",
            json!({"jobs": [
                {"name": "projects/proj/locations/us-central1/jobs/app-report"},
                {"name": "projects/proj/locations/us-central1/jobs/app-stale"},
                {"name": "projects/proj/locations/us-central1/jobs/other-stale"},
            ]}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut s = Scheduler::new("app");
        s.register("report", "* * * * *", tick(), ScheduleOptions::default());

        s.sync(&ctx, false).await.unwrap();
        let deletes = cloud.calls_to(HttpMethod::Delete, "jobs/");
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].path.ends_with("jobs/app-stale"));
    }
}
