//! Owns every handler and infrastructure of an app and drives them through
//! deploy, destroy and sync in dependency order.
//!
//! ```text
//!   deploy:  apis ─► infrastructures ─► get_config ─► backend.update_config
//!                                                          │
//!            invoker bindings ◄─ alerts ◄─ handlers ◄─ backend.deploy
//!
//!   destroy: handlers ─► backend (optional) ─► infrastructures
//! ```

use crate::backends::{Backend, BackendKind};
use crate::cloud_actions::check_or_enable_services;
use crate::config::GConfig;
use crate::dispatch::EventKind;
use crate::error::{GobletError, GobletResult};
use crate::handlers::{
    BqRemoteFunction, CloudTaskTarget, Eventarc, Http, Jobs, PubSub, Routes, Scheduler, Storage, Uptime,
};
use crate::infrastructures::{
    Alerts, ApiGateway, BqSparkStoredProcedure, CloudTaskQueue, PubSubTopics, Redis, VpcConnector,
};
use crate::permissions::normalize;
use crate::resource::{deploy_checked, DeployContext, Handler, InfraConfig, Infrastructure, Resource};
use log::{info, warn};

/// What a deploy or destroy touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Redeploy the backend even when the source checksum is unchanged.
    pub force: bool,
    pub skip_backend: bool,
    pub skip_handlers: bool,
    pub skip_infra: bool,
    /// On destroy, also delete uploaded source and build artifacts.
    pub purge_artifacts: bool,
}

impl DeployOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }

    pub fn infra_only() -> Self {
        Self {
            skip_backend: true,
            skip_handlers: true,
            ..Default::default()
        }
    }

    pub fn handlers_only() -> Self {
        Self {
            skip_backend: true,
            skip_infra: true,
            ..Default::default()
        }
    }
}

pub struct ResourceManager {
    app_name: String,
    backend_kind: BackendKind,

    // ── Handlers ──
    pub routes: Routes,
    pub scheduler: Scheduler,
    pub pubsub: PubSub,
    pub storage: Storage,
    pub eventarc: Eventarc,
    pub http: Http,
    pub jobs: Jobs,
    pub bq_remote_function: BqRemoteFunction,
    pub cloudtask_target: CloudTaskTarget,
    pub uptime: Uptime,

    // ── Infrastructures ──
    pub pubsub_topics: PubSubTopics,
    pub redis: Redis,
    pub vpc_connector: VpcConnector,
    pub cloudtask_queue: CloudTaskQueue,
    pub apigateway: ApiGateway,
    pub alerts: Alerts,
    pub bq_spark: BqSparkStoredProcedure,
}

impl ResourceManager {
    /// `project` pins Pub/Sub topics that live in another project.
    pub fn new(app_name: &str, backend_kind: BackendKind, project: Option<&str>) -> Self {
        Self {
            app_name: app_name.to_string(),
            backend_kind,
            routes: Routes::new(app_name),
            scheduler: Scheduler::new(app_name),
            pubsub: PubSub::new(app_name, backend_kind, project),
            storage: Storage::new(app_name, backend_kind),
            eventarc: Eventarc::new(app_name),
            http: Http::new(),
            jobs: Jobs::new(app_name),
            bq_remote_function: BqRemoteFunction::new(app_name),
            cloudtask_target: CloudTaskTarget::new(),
            uptime: Uptime::new(app_name),
            pubsub_topics: PubSubTopics::new(),
            redis: Redis::new(),
            vpc_connector: VpcConnector::new(),
            cloudtask_queue: CloudTaskQueue::new(),
            apigateway: ApiGateway::new(),
            alerts: Alerts::new(app_name),
            bq_spark: BqSparkStoredProcedure::new(app_name),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Handlers in deploy order.
    pub fn handlers(&self) -> Vec<&dyn Handler> {
        let handlers: [&dyn Handler; 10] = [
            &self.routes,
            &self.scheduler,
            &self.pubsub,
            &self.storage,
            &self.eventarc,
            &self.http,
            &self.jobs,
            &self.bq_remote_function,
            &self.cloudtask_target,
            &self.uptime,
        ];
        Vec::from(handlers)
    }

    fn handlers_mut(&mut self) -> Vec<&mut dyn Handler> {
        let handlers: [&mut dyn Handler; 10] = [
            &mut self.routes,
            &mut self.scheduler,
            &mut self.pubsub,
            &mut self.storage,
            &mut self.eventarc,
            &mut self.http,
            &mut self.jobs,
            &mut self.bq_remote_function,
            &mut self.cloudtask_target,
            &mut self.uptime,
        ];
        Vec::from(handlers)
    }

    /// Infrastructures in deploy order. Alerts come last: their conditions
    /// reference the backend and uptime checks.
    pub fn infrastructures(&self) -> Vec<&dyn Infrastructure> {
        let infras: [&dyn Infrastructure; 7] = [
            &self.pubsub_topics,
            &self.redis,
            &self.vpc_connector,
            &self.cloudtask_queue,
            &self.apigateway,
            &self.bq_spark,
            &self.alerts,
        ];
        Vec::from(infras)
    }

    /// Infrastructures the backend may depend on; everything but alerts.
    fn backing_infrastructures_mut(&mut self) -> Vec<&mut dyn Infrastructure> {
        let infras: [&mut dyn Infrastructure; 6] = [
            &mut self.pubsub_topics,
            &mut self.redis,
            &mut self.vpc_connector,
            &mut self.cloudtask_queue,
            &mut self.apigateway,
            &mut self.bq_spark,
        ];
        Vec::from(infras)
    }

    /// The handler serving invocations of `kind`. Jobs are run by name
    /// rather than dispatched, but still resolve here.
    pub fn handler(&self, kind: EventKind) -> &dyn Handler {
        match kind {
            EventKind::Job => &self.jobs,
            EventKind::PubSub => &self.pubsub,
            EventKind::Storage => &self.storage,
            EventKind::Schedule => &self.scheduler,
            EventKind::Uptime => &self.uptime,
            EventKind::CloudTaskTarget => &self.cloudtask_target,
            EventKind::Eventarc => &self.eventarc,
            EventKind::BqRemoteFunction => &self.bq_remote_function,
            EventKind::Http => &self.http,
            EventKind::Route => &self.routes,
        }
    }

    /// Whether the backend must serve HTTP traffic.
    pub fn is_http(&self) -> bool {
        !self.routes.is_empty()
            || !self.scheduler.is_empty()
            || !self.http.is_empty()
            || self.pubsub.is_http()
            || !self.bq_remote_function.is_empty()
            || !self.cloudtask_target.is_empty()
    }

    /// Union `other`'s registrations into this manager. Duplicate routes
    /// and cloud task targets are errors; other kinds overwrite.
    pub fn merge(&mut self, other: &ResourceManager) -> GobletResult<()> {
        self.routes.merge(&other.routes)?;
        self.scheduler.merge(&other.scheduler);
        self.pubsub.merge(&other.pubsub);
        self.storage.merge(&other.storage);
        self.eventarc.merge(&other.eventarc);
        self.http.merge(&other.http);
        self.jobs.merge(&other.jobs);
        self.bq_remote_function.merge(&other.bq_remote_function);
        self.cloudtask_target.merge(&other.cloudtask_target)?;
        self.uptime.merge(&other.uptime);

        self.pubsub_topics.merge(&other.pubsub_topics);
        self.redis.merge(&other.redis);
        self.vpc_connector.merge(&other.vpc_connector);
        self.cloudtask_queue.merge(&other.cloudtask_queue);
        self.apigateway.merge(&other.apigateway);
        self.alerts.merge(&other.alerts);
        self.bq_spark.merge(&other.bq_spark);
        Ok(())
    }

    fn resources(&self) -> Vec<&dyn Resource> {
        let resources: [&dyn Resource; 17] = [
            &self.routes,
            &self.scheduler,
            &self.pubsub,
            &self.storage,
            &self.eventarc,
            &self.http,
            &self.jobs,
            &self.bq_remote_function,
            &self.cloudtask_target,
            &self.uptime,
            &self.pubsub_topics,
            &self.redis,
            &self.vpc_connector,
            &self.cloudtask_queue,
            &self.apigateway,
            &self.bq_spark,
            &self.alerts,
        ];
        Vec::from(resources)
    }

    /// APIs every registered resource and the backend need, deduplicated.
    pub fn required_apis(&self, backend: &dyn Backend) -> Vec<&'static str> {
        let mut apis = backend.required_apis();
        for resource in self.resources().into_iter().filter(|r| !r.is_empty()) {
            apis.extend(resource.required_apis());
        }
        apis.sort_unstable();
        apis.dedup();
        apis
    }

    /// Permissions a deployer needs for this app.
    pub fn permissions(&self, backend: &dyn Backend) -> Vec<String> {
        let mut permissions = backend.permissions();
        for resource in self.resources().into_iter().filter(|r| !r.is_empty()) {
            permissions.extend(resource.permissions());
        }
        normalize(permissions)
    }

    /// Principals every handler needs on the backend invoker role.
    pub fn invoker_principals(&self, config: &GConfig) -> Vec<String> {
        let mut principals: Vec<String> = self
            .handlers()
            .into_iter()
            .filter(|h| !h.is_empty())
            .flat_map(|h| h.service_accounts(config))
            .collect();
        principals.sort();
        principals.dedup();
        principals
    }

    /// `client_versions` may only pin an API version the backend supports.
    pub fn check_backend_version(&self, config: &GConfig) -> GobletResult<()> {
        let key = self.backend_kind.version_key();
        match config.client_versions().get(key) {
            Some(version) if !self.backend_kind.supported_versions().contains(&version.as_str()) => {
                Err(GobletError::validation(format!(
                    "{} version {} is not supported by backend {}, expected one of {}",
                    key,
                    version,
                    self.backend_kind,
                    self.backend_kind.supported_versions().join(", ")
                )))
            }
            _ => Ok(()),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn deploy(
        &mut self,
        ctx: &DeployContext<'_>,
        backend: &mut dyn Backend,
        options: DeployOptions,
    ) -> GobletResult<()> {
        let apis = self.required_apis(backend);
        check_or_enable_services(ctx, &apis).await?;

        let mut infra_configs: Vec<InfraConfig> = Vec::new();
        for infra in self.backing_infrastructures_mut() {
            if infra.is_empty() {
                continue;
            }
            if !options.skip_infra {
                deploy_checked(infra, ctx).await?;
            }
            if let Some(config) = infra.get_config(ctx).await? {
                infra_configs.push(config);
            }
        }
        if !infra_configs.is_empty() {
            backend.update_config(&infra_configs);
        }

        let is_http = self.is_http();
        if options.skip_backend {
            info!(target: "goblet::deployer", "skipping backend deployment");
        } else {
            info!(target: "goblet::deployer", "deploying {} {}", backend.kind(), backend.name());
            backend.deploy(ctx, options.force, is_http).await?;
        }

        let backend: &dyn Backend = backend;
        let ctx = ctx.with_backend(backend);
        if options.skip_handlers {
            info!(target: "goblet::deployer", "skipping handler deployment");
        } else {
            for handler in self.handlers_mut() {
                deploy_checked(handler, &ctx).await?;
            }
        }
        if !options.skip_infra {
            deploy_checked(&mut self.alerts, &ctx).await?;
        }

        let principals = self.invoker_principals(backend.config());
        if !principals.is_empty() && !options.skip_backend {
            backend.add_invoker_binding(&ctx, &principals).await?;
        }
        Ok(())
    }

    pub async fn destroy(
        &self,
        ctx: &DeployContext<'_>,
        backend: &dyn Backend,
        options: DeployOptions,
    ) -> GobletResult<()> {
        let ctx = ctx.with_backend(backend);
        if !options.skip_handlers {
            for handler in self.handlers().into_iter().filter(|h| !h.is_empty()) {
                info!(target: "goblet::deployer", "destroying {}", handler.resource_type());
                handler.destroy(&ctx).await?;
            }
        }
        if !options.skip_backend {
            info!(target: "goblet::deployer", "destroying {} {}", backend.kind(), backend.name());
            backend.destroy(&ctx, options.purge_artifacts).await?;
        }
        if !options.skip_infra {
            for infra in self.infrastructures().into_iter().rev().filter(|i| !i.is_empty()) {
                info!(target: "goblet::deployer", "destroying {}", infra.resource_type());
                infra.destroy(&ctx).await?;
            }
        }
        Ok(())
    }

    /// Remove stale `{app}-` resources for every sync-capable kind. A
    /// resource the caller may not list is skipped.
    pub async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        for resource in self.resources().into_iter().filter(|r| r.can_sync()) {
            info!(target: "goblet::deployer", "syncing {}", resource.resource_type());
            match resource.sync(ctx, dryrun).await {
                Ok(()) => {}
                Err(e) if e.is_permission_denied() => {
                    warn!(
                        target: "goblet::deployer",
                        "permission denied while syncing {}, skipping",
                        resource.resource_type()
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{RouteOptions, ScheduleOptions, SubscriptionOptions};
    use crate::request::Response;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> ResourceManager {
        ResourceManager::new("app", BackendKind::CloudRun, None)
    }

    #[test]
    fn test_is_http_tracks_http_facing_handlers() {
        let mut rm = manager();
        assert!(!rm.is_http());
        rm.jobs.register("etl", 0, Arc::new(|_: u32| json!("ok")), Default::default()).unwrap();
        assert!(!rm.is_http());
        rm.scheduler.register("nightly", "0 0 * * *", Arc::new(|| Response::from("ok")), ScheduleOptions::default());
        assert!(rm.is_http());
    }

    #[test]
    fn test_pubsub_subscription_is_http_on_cloudrun() {
        let mut rm = manager();
        rm.pubsub.register("on_msg", "events", Arc::new(|_: &str| json!("ok")), SubscriptionOptions::default());
        assert!(rm.is_http());
    }

    #[test]
    fn test_backend_version_check() {
        let rm = manager();
        assert!(rm.check_backend_version(&GConfig::default()).is_ok());
        assert!(rm
            .check_backend_version(&GConfig::new(json!({"client_versions": {"run": "v2"}})))
            .is_ok());
        let err = rm
            .check_backend_version(&GConfig::new(json!({"client_versions": {"run": "v1"}})))
            .unwrap_err();
        assert!(matches!(err, GobletError::Validation(_)));

        let cf = ResourceManager::new("app", BackendKind::CloudFunctionV2, None);
        assert!(cf
            .check_backend_version(&GConfig::new(json!({"client_versions": {"cloudfunctions": "v1"}})))
            .is_err());
    }

    #[test]
    fn test_merge_rejects_duplicate_routes() {
        let mut a = manager();
        let mut b = manager();
        let f: crate::handlers::RouteFn = Arc::new(|_: &crate::request::Request, _: &std::collections::BTreeMap<String, String>| Response::from("x"));
        a.routes.register("home", "/home", f.clone(), RouteOptions::default()).unwrap();
        b.routes.register("other_home", "/home", f.clone(), RouteOptions::default()).unwrap();
        assert!(a.merge(&b).is_err());

        let mut c = manager();
        c.routes.register("about", "/about", f, RouteOptions::default()).unwrap();
        a.merge(&c).unwrap();
        assert!(a.routes.resolve("GET", "/about").is_some());
    }

    #[test]
    fn test_required_apis_only_for_registered_resources() {
        let mut rm = manager();
        let backend = crate::backends::create_backend(
            BackendKind::CloudRun,
            "app",
            GConfig::default(),
            Arc::new(crate::backends::StaticSource(b"src".to_vec())),
            Arc::new(crate::backends::GcloudBuilder::new(".")),
        );
        assert!(!rm.required_apis(backend.as_ref()).contains(&"redis"));
        rm.redis.register("cache");
        let apis = rm.required_apis(backend.as_ref());
        assert!(apis.contains(&"redis"));
        assert!(apis.contains(&"run"));
        let mut sorted = apis.clone();
        sorted.dedup();
        assert_eq!(apis, sorted);
    }

    #[tokio::test]
    async fn test_sync_skips_permission_denied() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Get, "jobs", 403);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let rm = manager();
        rm.sync(&ctx, false).await.unwrap();
        assert!(cloud.writes().is_empty());
    }
}
