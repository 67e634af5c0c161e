//! Cloud Run jobs. Each registered task index runs one function; the job's
//! container command is `goblet job run {job}`.

use super::scheduler::{AuthMethod, ScheduleOptions};
use super::JobFn;
use crate::backends::BackendKind;
use crate::cloud_actions::cloudbuild_artifact;
use crate::config::deep_merge;
use crate::dispatch::RuntimeEnv;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::short_name;
use async_trait::async_trait;
use goblet_gcp::{list_all, Verb, LOCATION_SCHEMA};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Clone, Default)]
struct CloudRunJob {
    tasks: BTreeMap<u32, JobFn>,
    /// Execution template overlay, set on task 0.
    execution_spec: Map<String, Value>,
}

pub struct Jobs {
    name: String,
    resources: BTreeMap<String, CloudRunJob>,
}

fn job_path(job_name: &str) -> String {
    format!("{}/jobs/{}", LOCATION_SCHEMA, job_name)
}

/// The Cloud Run admin endpoint that starts `{app}-{name}`.
pub fn job_run_uri(app: &str, name: &str) -> String {
    format!(
        "https://{{location_id}}-run.googleapis.com/apis/run.googleapis.com/v1/namespaces/{{project_id}}/jobs/{}-{}:run",
        app, name
    )
}

/// Scheduler options for a job schedule: POST to the run endpoint with OAuth.
pub fn job_schedule_options(app: &str, name: &str, timezone: &str) -> ScheduleOptions {
    ScheduleOptions::default()
        .with_timezone(timezone)
        .with_uri(&job_run_uri(app, name))
        .with_method("POST")
        .with_auth(AuthMethod::OauthToken)
}

impl Jobs {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// Register task `task_id` of job `{app}-{name}`. Only task 0 may carry
    /// an execution spec.
    pub fn register(&mut self, name: &str, task_id: u32, function: JobFn, execution_spec: Map<String, Value>) -> GobletResult<()> {
        if task_id != 0 && !execution_spec.is_empty() {
            return Err(GobletError::validation("Arguments can only be added to task_id with value 0"));
        }
        let job = self.resources.entry(format!("{}-{}", self.name, name)).or_default();
        job.tasks.insert(task_id, function);
        if !execution_spec.is_empty() {
            job.execution_spec = execution_spec;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Jobs) {
        for (name, job) in &other.resources {
            let current = self.resources.entry(name.clone()).or_default();
            current.tasks.extend(job.tasks.clone());
            if !job.execution_spec.is_empty() {
                current.execution_spec = job.execution_spec.clone();
            }
        }
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Run task `task_id` of the fully-qualified job `name`.
    pub fn run(&self, name: &str, task_id: u32) -> GobletResult<Value> {
        let job = self
            .resources
            .get(name)
            .ok_or_else(|| GobletError::NotFound(format!("Job {} not found", name)))?;
        let function = job.tasks.get(&task_id).ok_or_else(|| {
            GobletError::NotFound(format!("Job {} not found for CLOUD_RUN_TASK_INDEX: {}", name, task_id))
        })?;
        Ok(function(task_id))
    }

    /// The job resource body for `job_name` running `image`.
    pub fn job_body(&self, ctx: &DeployContext<'_>, job_name: &str, image: &str) -> GobletResult<Value> {
        let job = self
            .resources
            .get(job_name)
            .ok_or_else(|| GobletError::NotFound(format!("Job {} not found", job_name)))?;

        let mut container = json!(ctx.config.section("job_container"));
        if let Value::Object(ref mut c) = container {
            c.insert("image".into(), json!(image));
            c.insert("command".into(), json!(["goblet", "job", "run", job_name]));
        }
        let mut task_template = json!({"containers": [container]});
        deep_merge(&mut task_template, &Value::Object(ctx.config.section("job_spec")));
        let mut template = json!({
            "taskCount": job.tasks.len(),
            "template": task_template,
        });
        deep_merge(&mut template, &Value::Object(job.execution_spec.clone()));

        Ok(json!({
            "launchStage": "BETA",
            "labels": ctx.config.labels(),
            "template": template,
        }))
    }

    async fn deploy_job(&self, ctx: &DeployContext<'_>, job_name: &str, body: Value) -> GobletResult<()> {
        let jobs = ctx.clients.run_job();
        let op = match jobs
            .execute(ctx.api, Verb::Create, None, Some(body.clone()), &[("jobId", job_name)])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                info!(target: "goblet::deployer", "created job: {}", job_name);
                op
            }
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "updated job: {}", job_name);
                jobs.execute(ctx.api, Verb::Patch, Some(&job_path(job_name)), Some(body), &[])
                    .await?
            }
            Err(e) => return Err(e),
        };
        jobs.wait_for_operation(ctx.api, &op, ctx.poll).await?;
        Ok(())
    }

    async fn destroy_job(&self, ctx: &DeployContext<'_>, job_name: &str) -> GobletResult<()> {
        let jobs = ctx.clients.run_job();
        match jobs
            .execute(ctx.api, Verb::Delete, Some(&job_path(job_name)), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                jobs.wait_for_operation(ctx.api, &op, ctx.poll).await?;
                info!(target: "goblet::deployer", "Destroying job {}......", job_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "Job {} already destroyed", job_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Resource for Jobs {
    fn resource_type(&self) -> &'static str {
        "job"
    }

    fn valid_backends(&self) -> &'static [BackendKind] {
        &[BackendKind::CloudRun]
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudbuild", "run"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("run", "jobs");
        perms.extend(
            [
                "run.operations.get",
                "cloudbuild.builds.create",
                "cloudbuild.builds.get",
                "cloudbuild.builds.list",
            ]
            .map(String::from),
        );
        perms
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn can_sync(&self) -> bool {
        true
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let image = cloudbuild_artifact(ctx, ctx.config, &self.name).await?;
        info!(target: "goblet::deployer", "deploying cloudrun jobs......");
        for job_name in self.resources.keys() {
            let body = self.job_body(ctx, job_name, &image)?;
            self.deploy_job(ctx, job_name, body).await?;
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for job_name in self.resources.keys() {
            self.destroy_job(ctx, job_name).await?;
        }
        Ok(())
    }

    async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        let jobs = ctx.clients.run_job();
        let call = jobs.call(ctx.api.context(), &Verb::List, None, None, &[]);
        let prefix = format!("{}-", self.name);
        for job in list_all(ctx.api, call, "jobs").await? {
            let Some(full) = job.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let job_name = short_name(full);
            if !job_name.starts_with(&prefix) || self.resources.contains_key(job_name) {
                continue;
            }
            info!(target: "goblet::deployer", "Detected unused job in GCP {}", job_name);
            if !dryrun {
                self.destroy_job(ctx, job_name).await?;
            }
        }
        Ok(())
    }
}

impl Jobs {
    /// Run the job named by the request path with the task index the
    /// execution was started with.
    pub fn dispatch_task(&self, request: &Request, env: &RuntimeEnv) -> GobletResult<Response> {
        let task_id = env.task_index.unwrap_or(0);
        let name = request.path.trim_start_matches('/');
        info!(target: "goblet::dispatch", "running job {} task {}", name, task_id);
        Ok(Response::from(self.run(name, task_id)?))
    }
}

impl Handler for Jobs {
    /// Jobs need the runtime task index; see [`Jobs::dispatch_task`].
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        Err(GobletError::validation(format!(
            "job {} has no task index; run it through dispatch_task",
            request.path.trim_start_matches('/')
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GConfig;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};
    use std::sync::Arc;

    fn task(tag: &'static str) -> JobFn {
        Arc::new(move |index: u32| json!(format!("{}-{}", tag, index)))
    }

    #[test]
    fn test_run_by_task_index() {
        let mut jobs = Jobs::new("app");
        jobs.register("etl", 0, task("extract"), Map::new()).unwrap();
        jobs.register("etl", 1, task("load"), Map::new()).unwrap();
        assert_eq!(jobs.run("app-etl", 1).unwrap(), json!("load-1"));
        assert!(jobs.run("app-etl", 2).is_err());
        assert!(jobs.run("app-other", 0).is_err());

        let mut spec = Map::new();
        spec.insert("parallelism".into(), json!(2));
        assert!(jobs.register("etl", 3, task("x"), spec).is_err());
    }

    #[test]
    fn test_dispatch_task_uses_given_env() {
        let mut jobs = Jobs::new("app");
        jobs.register("etl", 0, task("extract"), Map::new()).unwrap();
        jobs.register("etl", 1, task("load"), Map::new()).unwrap();
        let request = Request::get("/app-etl");

        let resp = jobs.dispatch_task(&request, &RuntimeEnv::with_task_index(1)).unwrap();
        assert_eq!(resp.body, json!("load-1"));
        let resp = jobs.dispatch_task(&request, &RuntimeEnv::default()).unwrap();
        assert_eq!(resp.body, json!("extract-0"));
        assert!(matches!(jobs.dispatch(&request, None), Err(GobletError::Validation(_))));
    }

    #[test]
    fn test_schedule_uri_is_templated() {
        let opts = job_schedule_options("app", "etl", "UTC");
        assert_eq!(
            opts.uri.as_deref(),
            Some("https://{location_id}-run.googleapis.com/apis/run.googleapis.com/v1/namespaces/{project_id}/jobs/app-etl:run")
        );
        assert_eq!(opts.auth_method, AuthMethod::OauthToken);
        assert_eq!(opts.http_method.as_deref(), Some("POST"));
    }

    #[tokio::test]
    async fn test_job_body_and_patch_on_conflict() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "projects/proj/builds",
            json!({"builds": [{"results": {"images": [{
                "name": "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app",
                "digest": "sha256:abc"
            }]}}]}),
        );
        cloud.fail(HttpMethod::Post, "locations/us-central1/jobs", 409);
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({
            "labels": {"team": "data"},
            "job_container": {"resources": {"limits": {"memory": "1Gi"}}},
            "job_spec": {"maxRetries": 1},
        }));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);

        let mut jobs = Jobs::new("app");
        let mut spec = Map::new();
        spec.insert("parallelism".into(), json!(2));
        jobs.register("etl", 0, task("a"), spec).unwrap();
        jobs.register("etl", 1, task("b"), Map::new()).unwrap();
        jobs.deploy(&ctx).await.unwrap();

        let patch = cloud.calls_to(HttpMethod::Patch, "jobs/app-etl");
        assert_eq!(patch.len(), 1);
        let body = patch[0].body.clone().unwrap();
        assert_eq!(body["launchStage"], "BETA");
        assert_eq!(body["labels"]["team"], "data");
        assert_eq!(body["template"]["taskCount"], 2);
        assert_eq!(body["template"]["parallelism"], 2);
        assert_eq!(body["template"]["template"]["maxRetries"], 1);
        let container = &body["template"]["template"]["containers"][0];
        assert_eq!(
            container["image"],
            "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app@sha256:abc"
        );
        assert_eq!(container["command"], json!(["goblet", "job", "run", "app-etl"]));
        assert_eq!(container["resources"]["limits"]["memory"], "1Gi");
    }
}
