//! The application: registration surface, runtime entry point and the
//! deploy/destroy/sync front door.
//!
//! | Phase        | Entry point                      | Log target          |
//! |--------------|----------------------------------|---------------------|
//! | registration | `route`, `schedule`, `topic`, …  | none                |
//! | runtime      | [`Goblet::dispatch`]             | `goblet::dispatch`  |
//! | deploy       | [`Goblet::deploy`] and friends   | `goblet::deployer`  |

use crate::backends::{create_backend, Backend, BackendKind, GcloudBuilder, ImageBuilder, SourcePackager, StaticSource};
use crate::config::GConfig;
use crate::dispatch::{classify, EventKind, RuntimeEnv};
use crate::error::{GobletError, GobletResult};
use crate::handlers::scheduler::JOB_SCHEDULE_PREFIX;
use crate::handlers::{
    job_schedule_options, BqFn, CorsConfig, EventarcOptions, JobFn, NoArgFn, PubSubFn, RequestFn, RouteFn,
    RouteOptions, Routes, RoutesType, RoutineOptions, ScheduleOptions, StorageFn, SubscriptionOptions,
};
use crate::infrastructures::{Alert, CloudTaskClient, PubSubClient, SparkProcedureOptions};
use crate::manager::{DeployOptions, ResourceManager};
use crate::middleware::{AfterFn, BeforeFn, Middleware, Selector};
use crate::permissions::{create_custom_role, create_service_account};
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler};
use goblet_gcp::{CloudApi, PollSettings, VersionedClients};
use log::info;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Extra settings for a Cloud Run job task.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Overlay for the job's execution template; task 0 only.
    pub execution_spec: Map<String, Value>,
    /// Cron schedule starting the job; task 0 only.
    pub schedule: Option<String>,
    /// Defaults to `UTC`.
    pub timezone: Option<String>,
}

impl JobOptions {
    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.schedule = Some(schedule.to_string());
        self
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }

    pub fn with_execution_spec(mut self, spec: Map<String, Value>) -> Self {
        self.execution_spec = spec;
        self
    }
}

pub struct Goblet {
    name: String,
    backend_kind: BackendKind,
    config: GConfig,
    root: PathBuf,
    poll: PollSettings,
    resources: ResourceManager,
    middleware: Middleware,
    packager: Arc<dyn SourcePackager>,
    builder: Arc<dyn ImageBuilder>,
}

impl Goblet {
    pub fn new(name: &str, backend_kind: BackendKind) -> Self {
        Self::with_config(name, backend_kind, GConfig::default())
    }

    pub fn with_config(name: &str, backend_kind: BackendKind, config: GConfig) -> Self {
        let project = config
            .get_path(&["pubsub", "project"])
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            name: name.to_string(),
            backend_kind,
            resources: ResourceManager::new(name, backend_kind, project.as_deref()),
            config,
            root: PathBuf::from("."),
            poll: PollSettings::default(),
            middleware: Middleware::default(),
            packager: Arc::new(StaticSource(Vec::new())),
            builder: Arc::new(GcloudBuilder::new(".")),
        }
    }

    /// Project root holding `.goblet/` and the source to package.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self.builder = Arc::new(GcloudBuilder::new(self.root.clone()));
        self
    }

    pub fn with_packager(mut self, packager: Arc<dyn SourcePackager>) -> Self {
        self.packager = packager;
        self
    }

    pub fn with_image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// `cloudrun` serves routes directly instead of through API Gateway.
    pub fn with_routes_type(mut self, routes_type: RoutesType) -> Self {
        self.resources.routes = std::mem::replace(&mut self.resources.routes, Routes::new(&self.name))
            .with_routes_type(routes_type);
        self
    }

    /// CORS applied to every route without its own setting.
    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.resources.routes =
            std::mem::replace(&mut self.resources.routes, Routes::new(&self.name)).with_cors(cors);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn config(&self) -> &GConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn is_http(&self) -> bool {
        self.resources.is_http()
    }

    // ── Handlers ────────────────────────────────────────────────────────

    pub fn route(&mut self, name: &str, path: &str, function: RouteFn, options: RouteOptions) -> GobletResult<()> {
        self.resources.routes.register(name, path, function, options)
    }

    /// Returns the registered name (`{name}-{n}` for repeated schedules).
    pub fn schedule(&mut self, name: &str, schedule: &str, function: NoArgFn, options: ScheduleOptions) -> String {
        self.resources.scheduler.register(name, schedule, function, options)
    }

    pub fn topic(&mut self, name: &str, topic: &str, function: PubSubFn, options: SubscriptionOptions) {
        self.resources.pubsub.register(name, topic, function, options);
    }

    pub fn storage(&mut self, name: &str, bucket: &str, event_type: &str, function: StorageFn) -> GobletResult<()> {
        self.resources.storage.register(name, bucket, event_type, function)
    }

    /// Returns the trigger name.
    pub fn eventarc(&mut self, name: &str, function: RequestFn, options: EventarcOptions) -> String {
        self.resources.eventarc.register(name, function, options)
    }

    /// `headers` must all be present on the request; an empty value only
    /// checks presence.
    pub fn http(&mut self, name: &str, function: RequestFn, headers: BTreeMap<String, String>) {
        self.resources.http.register(name, function, headers);
    }

    /// Task `task_id` of job `{app}-{name}`. A schedule registers the
    /// scheduler entry `schedule-job-{name}`.
    pub fn job(&mut self, name: &str, task_id: u32, function: JobFn, options: JobOptions) -> GobletResult<()> {
        if task_id != 0 && options.schedule.is_some() {
            return Err(GobletError::validation("Arguments can only be added to task_id with value 0"));
        }
        self.resources.jobs.register(name, task_id, function, options.execution_spec)?;
        if let Some(ref schedule) = options.schedule {
            let timezone = options.timezone.as_deref().unwrap_or("UTC");
            self.resources.scheduler.register_target(
                &format!("{}{}", JOB_SCHEDULE_PREFIX, name),
                schedule,
                job_schedule_options(&self.name, name, timezone),
            );
        }
        Ok(())
    }

    /// Returns the routine id.
    pub fn bq_remote_function(&mut self, name: &str, function: BqFn, options: RoutineOptions) -> String {
        self.resources.bq_remote_function.register(name, function, options)
    }

    pub fn cloudtask_target(&mut self, name: &str, function: RequestFn) -> GobletResult<()> {
        self.resources.cloudtask_target.register(name, function)
    }

    pub fn uptime(&mut self, name: &str, function: NoArgFn, config: Map<String, Value>) {
        self.resources.uptime.register(name, function, config);
    }

    // ── Infrastructures ─────────────────────────────────────────────────

    pub fn pubsub_topic(&mut self, name: &str, config: Map<String, Value>, dlq: bool) -> PubSubClient {
        self.resources.pubsub_topics.register(name, config, dlq)
    }

    pub fn redis(&mut self, name: &str) {
        self.resources.redis.register(name);
    }

    pub fn vpc_connector(&mut self, name: &str, ip_cidr_range: Option<&str>) {
        self.resources.vpc_connector.register(name, ip_cidr_range);
    }

    pub fn cloudtask_queue(
        &mut self,
        id: &str,
        config: Option<Map<String, Value>>,
        service_account: Option<String>,
    ) -> CloudTaskClient {
        self.resources.cloudtask_queue.register(id, config, service_account)
    }

    pub fn apigateway(&mut self, name: &str, backend_url: &str, openapi: Value) {
        self.resources.apigateway.register(name, backend_url, openapi);
    }

    /// Returns the policy display name `{app}-{name}`.
    pub fn alert(&mut self, name: &str, alert: Alert) -> GobletResult<String> {
        self.resources.alerts.register(name, alert)
    }

    /// Returns the routine id.
    pub fn bq_spark_stored_procedure(&mut self, name: &str, options: SparkProcedureOptions) -> GobletResult<String> {
        let config = self.config.section("bqsparkstoredprocedure");
        self.resources.bq_spark.register(name, options, &config)
    }

    // ── Middleware ──────────────────────────────────────────────────────

    pub fn before_request(&mut self, selector: impl Into<Selector>, f: BeforeFn) {
        self.middleware.add_before(selector.into(), f);
    }

    pub fn after_request(&mut self, selector: impl Into<Selector>, f: AfterFn) {
        self.middleware.add_after(selector.into(), f);
    }

    /// Fold a sub-application's registrations and middleware into this one.
    pub fn merge(&mut self, other: &Goblet) -> GobletResult<()> {
        self.resources.merge(&other.resources)?;
        self.middleware.extend(&other.middleware);
        Ok(())
    }

    // ── Runtime ─────────────────────────────────────────────────────────

    /// Classify an invocation, run the matching middleware and handler.
    pub fn dispatch(&self, request: Request, context: Option<&EventContext>, env: &RuntimeEnv) -> GobletResult<Response> {
        let kind = classify(&request, context, env)?;
        info!(target: "goblet::dispatch", "{} event: {} {}", kind, request.method, request.path);
        let request = self.middleware.apply_before(kind, request);
        let response = match kind {
            EventKind::Job => self.resources.jobs.dispatch_task(&request, env)?,
            EventKind::Storage => match self.resources.storage.dispatch(&request, context) {
                Err(GobletError::NotFound(_)) => {
                    info!(target: "goblet::dispatch", "no storage function matched, trying eventarc");
                    self.resources.eventarc.dispatch(&request, context)?
                }
                other => other?,
            },
            other => self.resources.handler(other).dispatch(&request, context)?,
        };
        Ok(self.middleware.apply_after(kind, response))
    }

    /// Run the task of job `job` (`{app}-{name}`) selected by
    /// `CLOUD_RUN_TASK_INDEX`.
    pub fn run_job(&self, job: &str, env: &RuntimeEnv) -> GobletResult<Response> {
        self.resources.jobs.dispatch_task(&Request::get(&format!("/{}", job)), env)
    }

    // ── Deploy ──────────────────────────────────────────────────────────

    /// Versioned clients with the backend's API version unless pinned.
    pub fn clients(&self) -> VersionedClients {
        let pinned = self.config.client_versions();
        let key = self.backend_kind.version_key();
        let clients = VersionedClients::new(&pinned);
        if pinned.contains_key(key) {
            clients
        } else {
            clients.with_version(key, self.backend_kind.default_version())
        }
    }

    /// The backend for this app; named by `function_name` when configured.
    pub fn backend(&self) -> Box<dyn Backend> {
        let name = self.config.function_name().unwrap_or_else(|| self.name.clone());
        create_backend(
            self.backend_kind,
            &name,
            self.config.clone(),
            Arc::clone(&self.packager),
            Arc::clone(&self.builder),
        )
    }

    pub async fn deploy(&mut self, api: &dyn CloudApi, options: DeployOptions) -> GobletResult<()> {
        self.resources.check_backend_version(&self.config)?;
        let clients = self.clients();
        let mut backend = self.backend();
        let ctx = DeployContext::new(api, &clients, &self.config, &self.name, self.backend_kind)
            .with_poll(self.poll)
            .with_root(&self.root);
        info!(target: "goblet::deployer", "deploying {} to {}", self.name, ctx.project());
        self.resources.deploy(&ctx, backend.as_mut(), options).await?;
        info!(target: "goblet::deployer", "finished deploying {}", self.name);
        Ok(())
    }

    pub async fn destroy(&self, api: &dyn CloudApi, options: DeployOptions) -> GobletResult<()> {
        let clients = self.clients();
        let backend = self.backend();
        let ctx = DeployContext::new(api, &clients, &self.config, &self.name, self.backend_kind)
            .with_poll(self.poll)
            .with_root(&self.root);
        info!(target: "goblet::deployer", "destroying {}", self.name);
        self.resources.destroy(&ctx, backend.as_ref(), options).await
    }

    /// Delete `{app}-` resources no longer registered; `dryrun` only logs.
    pub async fn sync(&self, api: &dyn CloudApi, dryrun: bool) -> GobletResult<()> {
        let clients = self.clients();
        let backend = self.backend();
        let ctx = DeployContext::new(api, &clients, &self.config, &self.name, self.backend_kind)
            .with_poll(self.poll)
            .with_root(&self.root)
            .with_backend(backend.as_ref());
        self.resources.sync(&ctx, dryrun).await
    }

    /// Every permission a deployer of this app needs.
    pub fn permissions(&self) -> Vec<String> {
        let backend = self.backend();
        self.resources.permissions(backend.as_ref())
    }

    /// Create or update the `GobletDeployment{App}` custom role.
    pub async fn create_deployment_role(&self, api: &dyn CloudApi) -> GobletResult<Value> {
        create_custom_role(api, &self.clients(), &self.name, self.permissions()).await
    }

    /// Create the `{app}-deployer` service account.
    pub async fn create_deployment_service_account(&self, api: &dyn CloudApi) -> GobletResult<Value> {
        create_service_account(api, &self.clients(), &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HEADER_NAME, HEADER_TYPE};
    use serde_json::json;

    fn app() -> Goblet {
        Goblet::new("app", BackendKind::CloudRun)
    }

    #[test]
    fn test_dispatch_schedule() {
        let mut app = app();
        app.schedule("nightly", "0 0 * * *", Arc::new(|| Response::from("ran")), ScheduleOptions::default());
        let req = Request::get("/").with_header(HEADER_TYPE, "schedule").with_header(HEADER_NAME, "nightly");
        let resp = app.dispatch(req, None, &RuntimeEnv::default()).unwrap();
        assert_eq!(resp.body, json!("ran"));
    }

    #[test]
    fn test_dispatch_route_with_middleware() {
        let mut app = app();
        app.route(
            "greet",
            "/hello/{name}",
            Arc::new(|req: &Request, params: &BTreeMap<String, String>| {
                let who = req.header("X-Who").unwrap_or_default().to_string();
                Response::from(json!(format!("{} {}", params["name"], who)))
            }),
            RouteOptions::default(),
        )
        .unwrap();
        app.before_request(EventKind::Route, Arc::new(|r: Request| r.with_header("X-Who", "via-mw")));
        app.before_request(EventKind::PubSub, Arc::new(|r: Request| r.with_header("X-Who", "wrong")));
        app.after_request(Selector::All, Arc::new(|r: Response| r.with_header("X-Done", "1")));

        let resp = app.dispatch(Request::get("/hello/bob"), None, &RuntimeEnv::default()).unwrap();
        assert_eq!(resp.body, json!("bob via-mw"));
        assert_eq!(resp.headers["X-Done"], "1");
    }

    #[test]
    fn test_storage_falls_back_to_eventarc() {
        let mut app = Goblet::new("app", BackendKind::CloudFunctionV2);
        app.storage("on_upload", "bucket-a", "finalized", Arc::new(|_: &Value| json!("storage")))
            .unwrap();
        let ctx = EventContext::new("google.storage.object.finalize", "projects/_/buckets/bucket-b");
        let err = app
            .dispatch(Request::event(json!({"bucket": "bucket-b"})), Some(&ctx), &RuntimeEnv::default())
            .unwrap_err();
        assert!(matches!(err, GobletError::NotFound(_)));

        let resp = app
            .dispatch(Request::event(json!({"bucket": "bucket-a"})), Some(&ctx), &RuntimeEnv::default())
            .unwrap();
        assert_eq!(resp.body, json!("storage"));
    }

    #[test]
    fn test_job_dispatch_uses_task_index() {
        let mut app = app();
        app.job("etl", 0, Arc::new(|i: u32| json!(i)), JobOptions::default()).unwrap();
        app.job("etl", 1, Arc::new(|i: u32| json!(i * 10)), JobOptions::default()).unwrap();
        let resp = app
            .dispatch(Request::get("app-etl"), None, &RuntimeEnv::with_task_index(1))
            .unwrap();
        assert_eq!(resp.body, json!(10));
    }

    #[test]
    fn test_job_schedule_only_on_task_zero() {
        let mut app = app();
        let schedule = JobOptions::default().with_schedule("0 * * * *");
        assert!(app.job("etl", 1, Arc::new(|_: u32| json!(1)), schedule.clone()).is_err());
        app.job("etl", 0, Arc::new(|_: u32| json!(0)), schedule).unwrap();
        assert_eq!(app.resources().scheduler.names(), vec!["schedule-job-etl"]);
    }

    #[test]
    fn test_unknown_event() {
        let app = app();
        let err = app.dispatch(Request::default(), None, &RuntimeEnv::default()).unwrap_err();
        assert!(matches!(err, GobletError::UnknownEventKind(_)));
    }

    #[test]
    fn test_merge_sub_app() {
        let mut app = app();
        let mut sub = Goblet::new("app", BackendKind::CloudRun);
        sub.route("ping", "/ping", Arc::new(|_: &Request, _: &BTreeMap<String, String>| Response::from("pong")), RouteOptions::default())
            .unwrap();
        sub.after_request(Selector::All, Arc::new(|r: Response| r.with_status(201)));
        app.merge(&sub).unwrap();
        let resp = app.dispatch(Request::get("/ping"), None, &RuntimeEnv::default()).unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, json!("pong"));
    }

    #[test]
    fn test_clients_follow_backend_version() {
        let app = Goblet::new("app", BackendKind::CloudFunctionV2);
        assert_eq!(app.clients().version("cloudfunctions"), "v2");
        let pinned = Goblet::with_config(
            "app",
            BackendKind::CloudFunctionV2,
            GConfig::new(json!({"client_versions": {"cloudfunctions": "v2beta"}})),
        );
        assert_eq!(pinned.clients().version("cloudfunctions"), "v2beta");
    }
}
