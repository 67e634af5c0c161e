//! Cloud Run backend.
//!
//! ```text
//! package → md5 label compare ──unchanged──▶ skip
//!                │ changed
//!                ▼
//! gcloud builds submit --pack → latest build artifact → revision spec
//!                ▼
//! services.create (409 → patch) → wait for operation
//! ```
//!
//! The deployed source is tracked with the `goblet-source-md5` service
//! label (hex md5; label values cannot hold base64).

use super::{
    access_secret, infra_environment, infra_vpc_connector, parse_seconds, source_checksum, Backend,
    BackendKind, EventFunction, SourceHandle, SourcePackager, ENTRY_POINT,
};
use crate::cloud_actions::{
    artifact_registry, cloudbuild_artifact, deploy_cloudrun, destroy_cloudrun, get_cloudrun,
    get_cloudrun_url, service_path,
};
use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig};
use async_trait::async_trait;
use goblet_gcp::iam;
use log::info;
use md5::{Digest, Md5};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub const SOURCE_LABEL: &str = "goblet-source-md5";
pub const ARTIFACT_TAG_ENV: &str = "GOBLET_ARTIFACT_TAG";
pub const BUILD_ARGS_ENV: &str = "GOBLET_BUILD_ARGS";

/// Hex md5, usable as a label value.
pub fn source_label(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

// ── Image Builder ───────────────────────────────────────────────────────

/// Builds and pushes the container image for a service.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, ctx: &DeployContext<'_>, config: &GConfig, name: &str) -> GobletResult<()>;
}

/// `gcloud builds submit --pack image=…` run in the source directory.
pub struct GcloudBuilder {
    pub source_dir: PathBuf,
}

impl GcloudBuilder {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
        }
    }

    pub fn command_args(ctx: &DeployContext<'_>, config: &GConfig, name: &str) -> Vec<String> {
        let tag = std::env::var(ARTIFACT_TAG_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| {
                config
                    .get_path(&["deploy", "artifact_tag"])
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "latest".to_string());
        let mut args = vec![
            "builds".to_string(),
            "submit".to_string(),
            "--project".to_string(),
            ctx.project().to_string(),
            "--pack".to_string(),
            format!("image={}:{}", artifact_registry(ctx, config, name), tag),
        ];
        if let Some(timeout) = config.get_path(&["cloudbuild", "timeout"]).and_then(|v| v.as_str()) {
            args.push("--timeout".to_string());
            args.push(timeout.to_string());
        }
        if let Some(sa) = config.get_path(&["cloudbuild", "serviceAccount"]).and_then(|v| v.as_str()) {
            args.push("--service-account".to_string());
            args.push(sa.to_string());
        }
        if let Ok(extra) = std::env::var(BUILD_ARGS_ENV) {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args
    }
}

#[async_trait]
impl ImageBuilder for GcloudBuilder {
    async fn build(&self, ctx: &DeployContext<'_>, config: &GConfig, name: &str) -> GobletResult<()> {
        let args = Self::command_args(ctx, config, name);
        info!(target: "goblet::deployer", "building image: gcloud {}", args.join(" "));
        let status = tokio::process::Command::new("gcloud")
            .args(&args)
            .current_dir(&self.source_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(GobletError::Build(format!("gcloud builds submit exited with {}", status)));
        }
        Ok(())
    }
}

// ── Traffic ─────────────────────────────────────────────────────────────

/// Give the new revision `percent` of traffic and scale every existing
/// allocation down proportionally. The largest allocation absorbs rounding
/// so the total stays 100.
pub fn split_traffic(service: &Value, percent: u64) -> Vec<Value> {
    let quotient = (100 - percent.min(100)) as f64 / 100.0;
    let latest_ready = service
        .get("latestReadyRevision")
        .and_then(|v| v.as_str())
        .map(|r| r.rsplit('/').next().unwrap_or(r).to_string())
        .unwrap_or_default();

    let mut traffic: Vec<Value> = Vec::new();
    let mut max_val = 0u64;
    let mut max_loc = 0usize;
    let mut sum = 0u64;
    for status in service.get("trafficStatuses").and_then(|t| t.as_array()).into_iter().flatten() {
        let old = status.get("percent").and_then(|p| p.as_u64()).unwrap_or(0);
        let new = (old as f64 * quotient).ceil() as u64;
        let revision = if status.get("type").and_then(|t| t.as_str()) == Some("TRAFFIC_TARGET_ALLOCATION_TYPE_LATEST") {
            latest_ready.clone()
        } else {
            status.get("revision").and_then(|r| r.as_str()).unwrap_or_default().to_string()
        };
        traffic.push(json!({
            "type": "TRAFFIC_TARGET_ALLOCATION_TYPE_REVISION",
            "revision": revision,
            "percent": new,
        }));
        if old > max_val {
            max_val = old;
            max_loc = traffic.len() - 1;
        }
        sum += new;
    }
    traffic.push(json!({ "type": "TRAFFIC_TARGET_ALLOCATION_TYPE_LATEST", "percent": percent }));
    if percent > max_val {
        max_loc = traffic.len() - 1;
    }
    sum += percent;

    if sum > 100 {
        if let Some(entry) = traffic.get_mut(max_loc) {
            let current = entry["percent"].as_u64().unwrap_or(0);
            entry["percent"] = json!(current.saturating_sub(sum - 100));
        }
    }
    traffic
}

// ── Backend ─────────────────────────────────────────────────────────────

pub struct CloudRun {
    name: String,
    config: GConfig,
    packager: Arc<dyn SourcePackager>,
    builder: Arc<dyn ImageBuilder>,
    source: Option<SourceHandle>,
}

impl CloudRun {
    pub fn new(
        name: &str,
        config: GConfig,
        packager: Arc<dyn SourcePackager>,
        builder: Arc<dyn ImageBuilder>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            packager,
            builder,
            source: None,
        }
    }

    fn container(&self) -> Map<String, Value> {
        let mut container = self.config.section("cloudrun_container");
        if !container.get("command").map(|c| c.is_array()).unwrap_or(false) {
            container.insert(
                "command".into(),
                json!(["functions-framework", format!("--target={}", ENTRY_POINT)]),
            );
        }
        container
    }

    /// Service body for the new revision.
    pub fn revision_body(&self, artifact: &str, label: &str, existing: Option<&Value>) -> Value {
        let mut container = self.container();
        container.insert("image".into(), json!(artifact));
        let mut template = self.config.section("cloudrun_revision");
        template.insert("containers".into(), json!([container]));

        let mut labels = self.config.labels();
        labels.insert(SOURCE_LABEL.into(), json!(label));

        let mut body = Map::new();
        body.insert("template".into(), Value::Object(template));
        body.insert("labels".into(), Value::Object(labels));
        let mut traffic_percent = None;
        for (k, v) in self.config.section("cloudrun") {
            if k == "traffic" {
                traffic_percent = v.as_u64();
            } else if k != "service-account" {
                body.insert(k, v);
            }
        }
        if let (Some(percent), Some(service)) = (traffic_percent, existing) {
            body.insert("traffic".into(), json!(split_traffic(service, percent)));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl Backend for CloudRun {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudRun
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &GConfig {
        &self.config
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["run", "cloudbuild", "artifactregistry"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("run", "services");
        perms.extend(
            [
                "run.services.getIamPolicy",
                "run.services.setIamPolicy",
                "run.operations.get",
                "cloudbuild.builds.create",
                "cloudbuild.builds.list",
                "iam.serviceAccounts.actAs",
            ]
            .map(String::from),
        );
        perms
    }

    fn source(&self) -> Option<&SourceHandle> {
        self.source.as_ref()
    }

    fn service_account(&self) -> Option<String> {
        self.config
            .get_path(&["cloudrun_revision", "serviceAccount"])
            .or_else(|| self.config.get_path(&["cloudrun", "service-account"]))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn timeout_secs(&self) -> Option<u64> {
        parse_seconds(self.config.get_path(&["cloudrun_revision", "timeout"]))
    }

    async fn deploy(
        &mut self,
        ctx: &DeployContext<'_>,
        force: bool,
        _http: bool,
    ) -> GobletResult<Option<SourceHandle>> {
        let archive = self.packager.package(&self.config)?;
        let label = source_label(&archive);
        let existing = get_cloudrun(ctx, &self.name).await?;
        let deployed_label = existing
            .as_ref()
            .and_then(|s| s.get("labels"))
            .and_then(|l| l.get(SOURCE_LABEL))
            .and_then(|v| v.as_str());
        if !force && deployed_label == Some(label.as_str()) {
            info!(target: "goblet::deployer", "No changes detected....");
            self.source = None;
            return Ok(None);
        }

        self.builder.build(ctx, &self.config, &self.name).await?;
        let artifact = cloudbuild_artifact(ctx, &self.config, &self.name).await?;
        let body = self.revision_body(&artifact, &label, existing.as_ref());
        deploy_cloudrun(ctx, body, &self.name).await?;

        let source = SourceHandle {
            upload_url: String::new(),
            storage_source: None,
            checksum: source_checksum(&archive),
        };
        self.source = Some(source.clone());
        Ok(Some(source))
    }

    async fn destroy(&self, ctx: &DeployContext<'_>, purge_artifacts: bool) -> GobletResult<()> {
        destroy_cloudrun(ctx, &self.name).await?;
        if purge_artifacts {
            info!(target: "goblet::deployer", "artifact registry images for {} are kept", self.name);
        }
        Ok(())
    }

    async fn http_endpoint(&self, ctx: &DeployContext<'_>) -> GobletResult<String> {
        get_cloudrun_url(ctx, &self.name).await
    }

    async fn get_environment_vars(&self, ctx: &DeployContext<'_>) -> GobletResult<Map<String, Value>> {
        let mut env = Map::new();
        let entries = self.container().get("env").and_then(|e| e.as_array()).cloned().unwrap_or_default();
        for entry in entries {
            let Some(name) = entry.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            if let Some(value) = entry.get("value") {
                env.insert(name.to_string(), value.clone());
            } else if let Some(secret_ref) = entry.get("valueSource").and_then(|s| s.get("secretKeyRef")) {
                let secret = secret_ref.get("secret").and_then(|s| s.as_str()).unwrap_or_default();
                let version = secret_ref.get("version").and_then(|v| v.as_str()).unwrap_or("latest");
                env.insert(name.to_string(), json!(access_secret(ctx, secret, version).await?));
            }
        }
        Ok(env)
    }

    async fn add_invoker_binding(&self, ctx: &DeployContext<'_>, principals: &[String]) -> GobletResult<()> {
        let run = ctx.clients.run();
        let path = service_path(ctx, &self.name);
        for principal in principals {
            let member = super::cloudfunction_v1::member(principal);
            iam::add_binding(ctx.api, &run, &path, "roles/run.invoker", &member).await?;
        }
        Ok(())
    }

    fn update_config(&mut self, infra_configs: &[InfraConfig]) {
        let mut overlay = Map::new();
        if let Some((name, _)) = infra_vpc_connector(infra_configs) {
            overlay.insert(
                "cloudrun_revision".into(),
                json!({ "vpcAccess": { "connector": name, "egress": "PRIVATE_RANGES_ONLY" } }),
            );
        }
        let env = infra_environment(infra_configs);
        if !env.is_empty() {
            let mut entries: Vec<Value> = self
                .container()
                .get("env")
                .and_then(|e| e.as_array())
                .cloned()
                .unwrap_or_default();
            entries.retain(|e| {
                e.get("name")
                    .and_then(|n| n.as_str())
                    .map(|n| !env.contains_key(n))
                    .unwrap_or(true)
            });
            for (k, v) in env {
                let value = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                entries.push(json!({ "name": k, "value": value }));
            }
            overlay.insert("cloudrun_container".into(), json!({ "env": entries }));
        }
        if !overlay.is_empty() {
            self.config = self.config.with_overlay(&Value::Object(overlay));
        }
    }

    async fn deploy_event_function(&self, _ctx: &DeployContext<'_>, function: &EventFunction) -> GobletResult<()> {
        Err(GobletError::validation(format!(
            "cloudrun cannot host background function {}, use eventarc",
            function.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StaticSource;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBuilder(AtomicUsize);

    #[async_trait]
    impl ImageBuilder for CountingBuilder {
        async fn build(&self, _ctx: &DeployContext<'_>, _config: &GConfig, _name: &str) -> GobletResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stub_build(cloud: &FakeCloud) {
        cloud.on(
            HttpMethod::Get,
            "projects/proj/builds",
            json!({"builds": [{"results": {"images": [{
                "name": "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app",
                "digest": "sha256:abc"
            }]}}]}),
        );
    }

    #[test]
    fn test_split_traffic_keeps_total() {
        let service = json!({
            "latestReadyRevision": "projects/p/locations/l/services/app/revisions/app-002",
            "trafficStatuses": [
                {"type": "TRAFFIC_TARGET_ALLOCATION_TYPE_LATEST", "percent": 70},
                {"type": "TRAFFIC_TARGET_ALLOCATION_TYPE_REVISION", "revision": "app-001", "percent": 30},
            ]
        });
        let traffic = split_traffic(&service, 25);
        let total: u64 = traffic.iter().map(|t| t["percent"].as_u64().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(traffic[0]["revision"], "app-002");
        assert_eq!(traffic[1]["revision"], "app-001");
        assert_eq!(traffic[2]["type"], "TRAFFIC_TARGET_ALLOCATION_TYPE_LATEST");
        assert_eq!(traffic[2]["percent"], 25);
    }

    #[tokio::test]
    async fn test_deploy_builds_and_labels_source() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Get, "services/app", 404);
        stub_build(&cloud);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);

        let builder = Arc::new(CountingBuilder::default());
        let mut run = CloudRun::new(
            "app",
            GConfig::new(json!({"cloudrun": {"traffic": 10, "ingress": "INGRESS_TRAFFIC_ALL"}})),
            Arc::new(StaticSource(b"src".to_vec())),
            builder.clone(),
        );
        run.deploy(&ctx, false, true).await.unwrap();
        assert_eq!(builder.0.load(Ordering::SeqCst), 1);

        let create = &cloud.calls_to(HttpMethod::Post, "locations/us-central1/services")[0];
        assert_eq!(create.query_value("serviceId"), Some("app"));
        let body = create.body.as_ref().unwrap();
        assert_eq!(
            body["template"]["containers"][0]["image"],
            "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app@sha256:abc"
        );
        assert_eq!(
            body["template"]["containers"][0]["command"],
            json!(["functions-framework", "--target=goblet_entrypoint"])
        );
        assert_eq!(body["labels"][SOURCE_LABEL], source_label(b"src"));
        assert_eq!(body["ingress"], "INGRESS_TRAFFIC_ALL");
        // no live service, so no traffic split
        assert!(body.get("traffic").is_none());
    }

    #[tokio::test]
    async fn test_matching_label_skips_build_and_deploy() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "services/app",
            json!({"name": "app", "labels": {SOURCE_LABEL: source_label(b"src")}}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let builder = Arc::new(CountingBuilder::default());
        let mut run = CloudRun::new("app", GConfig::default(), Arc::new(StaticSource(b"src".to_vec())), builder.clone());

        assert!(run.deploy(&ctx, false, true).await.unwrap().is_none());
        assert_eq!(builder.0.load(Ordering::SeqCst), 0);
        assert!(cloud.writes().is_empty());
    }

    #[test]
    fn test_update_config_appends_env_and_vpc() {
        let mut run = CloudRun::new(
            "app",
            GConfig::new(json!({"cloudrun_container": {"env": [{"name": "A", "value": "1"}]}})),
            Arc::new(StaticSource(vec![])),
            Arc::new(CountingBuilder::default()),
        );
        run.update_config(&[
            InfraConfig::new("redis", json!({"REDIS_PORT": "6379"}).as_object().unwrap().clone()),
            InfraConfig::new("vpcconnector", json!({"name": "conn", "egress": "PRIVATE_RANGES_ONLY"}).as_object().unwrap().clone()),
        ]);
        let env = run.config().get_path(&["cloudrun_container", "env"]).unwrap().clone();
        assert_eq!(env, json!([{"name": "A", "value": "1"}, {"name": "REDIS_PORT", "value": "6379"}]));
        assert_eq!(
            run.config().get_path(&["cloudrun_revision", "vpcAccess", "connector"]).unwrap(),
            "conn"
        );
    }

    #[test]
    fn test_gcloud_args() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"cloudbuild": {"timeout": "1200s"}}));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let args = GcloudBuilder::command_args(&ctx, &config, "app");
        assert_eq!(&args[..2], &["builds".to_string(), "submit".to_string()]);
        assert!(args.iter().any(|a| a.starts_with("image=us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app:")));
        assert!(args.windows(2).any(|w| w[0] == "--timeout" && w[1] == "1200s"));
    }
}
