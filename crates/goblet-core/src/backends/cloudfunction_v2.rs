//! Cloud Functions (2nd gen) backend.
//!
//! Same source flow as 1st gen; the function body carries `buildConfig`
//! and `serviceConfig` instead of top-level runtime settings, and user
//! settings come from `cloudfunction` overlaid with `cloudfunction_v2`.

use super::cloudfunction_v1::{member, stage_source};
use super::{
    infra_environment, infra_vpc_connector, parse_seconds, resolve_function_secrets, Backend,
    BackendKind, EventFunction, SourceHandle, SourcePackager, ENTRY_POINT,
};
use crate::cloud_actions::{
    create_cloudfunction, destroy_cloudfunction, destroy_cloudfunction_artifacts, function_path,
    function_runtime, get_cloudfunction_url,
};
use crate::config::{merged, GConfig};
use crate::error::GobletResult;
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig};
use async_trait::async_trait;
use goblet_gcp::iam;
use log::info;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const CONFIG_KEY: &str = "cloudfunction";
pub const V2_CONFIG_KEY: &str = "cloudfunction_v2";

pub struct CloudFunctionV2 {
    name: String,
    config: GConfig,
    packager: Arc<dyn SourcePackager>,
    source: Option<SourceHandle>,
}

impl CloudFunctionV2 {
    pub fn new(name: &str, config: GConfig, packager: Arc<dyn SourcePackager>) -> Self {
        Self {
            name: name.to_string(),
            config,
            packager,
            source: None,
        }
    }

    /// `cloudfunction` deep-merged with `cloudfunction_v2`.
    fn user_config(&self) -> Map<String, Value> {
        let base = Value::Object(self.config.section(CONFIG_KEY));
        let v2 = Value::Object(self.config.section(V2_CONFIG_KEY));
        match merged(&base, &v2) {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    fn service_config(&self) -> Map<String, Value> {
        self.user_config()
            .get("serviceConfig")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    }

    fn function_body(
        &self,
        ctx: &DeployContext<'_>,
        name: &str,
        source: &SourceHandle,
        event_trigger: Option<Value>,
    ) -> GobletResult<Value> {
        let version = ctx.clients.cloudfunctions().version;
        let mut build = json!({
            "runtime": function_runtime(&self.config, &version)?,
            "entryPoint": ENTRY_POINT,
            "source": { "storageSource": source.storage_source.clone().unwrap_or(Value::Null) },
        });
        let mut body = Map::new();
        body.insert("name".into(), json!(function_path(ctx, name)));
        body.insert("environment".into(), json!("GEN_2"));
        body.insert(
            "description".into(),
            json!(self.config.str_value("description").unwrap_or_else(|| "created by goblet".into())),
        );
        body.insert("labels".into(), Value::Object(self.config.labels()));
        if let Some(trigger) = event_trigger {
            body.insert("eventTrigger".into(), trigger);
        }
        for (k, v) in self.user_config() {
            if k == "buildConfig" {
                crate::config::deep_merge(&mut build, &v);
            } else {
                body.insert(k, v);
            }
        }
        body.insert("buildConfig".into(), build);
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl Backend for CloudFunctionV2 {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudFunctionV2
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &GConfig {
        &self.config
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudfunctions", "run", "cloudbuild", "artifactregistry"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("cloudfunctions", "functions");
        perms.extend(gcp_generic_resource_permissions("run", "services"));
        perms.extend(
            [
                "cloudfunctions.functions.sourceCodeSet",
                "cloudfunctions.functions.getIamPolicy",
                "cloudfunctions.functions.setIamPolicy",
                "cloudfunctions.operations.get",
            ]
            .map(String::from),
        );
        perms
    }

    fn source(&self) -> Option<&SourceHandle> {
        self.source.as_ref()
    }

    fn service_account(&self) -> Option<String> {
        self.service_config()
            .get("serviceAccountEmail")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn timeout_secs(&self) -> Option<u64> {
        parse_seconds(self.service_config().get("timeoutSeconds"))
    }

    async fn deploy(
        &mut self,
        ctx: &DeployContext<'_>,
        force: bool,
        http: bool,
    ) -> GobletResult<Option<SourceHandle>> {
        let archive = self.packager.package(&self.config)?;
        let headers = vec![("content-type".to_string(), "application/zip".to_string())];
        self.source = stage_source(ctx, &self.name, archive, &headers, force).await?;
        let Some(source) = self.source.clone() else {
            return Ok(None);
        };
        if http {
            let body = self.function_body(ctx, &self.name, &source, None)?;
            create_cloudfunction(ctx, body, &self.config).await?;
        }
        Ok(Some(source))
    }

    async fn destroy(&self, ctx: &DeployContext<'_>, purge_artifacts: bool) -> GobletResult<()> {
        destroy_cloudfunction(ctx, &self.name).await?;
        if purge_artifacts {
            destroy_cloudfunction_artifacts(ctx, &self.name).await?;
        }
        Ok(())
    }

    async fn http_endpoint(&self, ctx: &DeployContext<'_>) -> GobletResult<String> {
        get_cloudfunction_url(ctx, &self.name).await
    }

    async fn get_environment_vars(&self, ctx: &DeployContext<'_>) -> GobletResult<Map<String, Value>> {
        let service = self.service_config();
        let mut env = service
            .get("environmentVariables")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        resolve_function_secrets(ctx, service.get("secretEnvironmentVariables"), &mut env).await?;
        Ok(env)
    }

    async fn add_invoker_binding(&self, ctx: &DeployContext<'_>, principals: &[String]) -> GobletResult<()> {
        let functions = ctx.clients.cloudfunctions();
        let path = function_path(ctx, &self.name);
        for principal in principals {
            iam::add_binding(ctx.api, &functions, &path, "roles/cloudfunctions.invoker", &member(principal))
                .await?;
        }
        Ok(())
    }

    fn update_config(&mut self, infra_configs: &[InfraConfig]) {
        let mut service = Map::new();
        if let Some((name, egress)) = infra_vpc_connector(infra_configs) {
            service.insert("vpcConnector".into(), name);
            service.insert("vpcConnectorEgressSettings".into(), egress);
        }
        let env = infra_environment(infra_configs);
        if !env.is_empty() {
            service.insert("environmentVariables".into(), Value::Object(env));
        }
        if !service.is_empty() {
            self.config = self
                .config
                .with_overlay(&json!({ CONFIG_KEY: { "serviceConfig": service } }));
        }
    }

    async fn deploy_event_function(&self, ctx: &DeployContext<'_>, function: &EventFunction) -> GobletResult<()> {
        let Some(source) = self.source.as_ref() else {
            info!(target: "goblet::deployer", "source unchanged, skipping function {}", function.name);
            return Ok(());
        };
        let body = self.function_body(ctx, &function.name, source, Some(function.trigger.clone()))?;
        create_cloudfunction(ctx, body, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::StaticSource;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};

    #[tokio::test]
    async fn test_gen2_body_and_function_id() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Get, "functions/app", 404);
        cloud.on(
            HttpMethod::Post,
            "functions:generateUploadUrl",
            json!({"uploadUrl": "https://u", "storageSource": {"bucket": "b", "object": "o"}}),
        );
        let clients = VersionedClients::default().with_version("cloudfunctions", "v2");
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudFunctionV2);

        let mut cf = CloudFunctionV2::new(
            "app",
            GConfig::new(json!({
                "runtime": "python311",
                "cloudfunction": {"serviceConfig": {"timeoutSeconds": 300}},
                "cloudfunction_v2": {"buildConfig": {"dockerRepository": "r"}},
            })),
            Arc::new(StaticSource(b"src".to_vec())),
        );
        cf.deploy(&ctx, false, true).await.unwrap();
        assert_eq!(cf.timeout_secs(), Some(300));

        let create = cloud
            .calls_to(HttpMethod::Post, "v2/projects/proj/locations/us-central1/functions")
            .into_iter()
            .find(|c| c.path.ends_with("/functions"))
            .unwrap();
        assert_eq!(create.query_value("functionId"), Some("app"));
        let body = create.body.unwrap();
        assert_eq!(body["environment"], "GEN_2");
        assert_eq!(body["buildConfig"]["runtime"], "python311");
        assert_eq!(body["buildConfig"]["entryPoint"], "goblet_entrypoint");
        assert_eq!(body["buildConfig"]["dockerRepository"], "r");
        assert_eq!(body["buildConfig"]["source"]["storageSource"]["bucket"], "b");
        assert_eq!(body["serviceConfig"]["timeoutSeconds"], 300);
    }

    #[test]
    fn test_update_config_targets_service_config() {
        let mut cf = CloudFunctionV2::new("app", GConfig::default(), Arc::new(StaticSource(vec![])));
        cf.update_config(&[InfraConfig::new(
            "vpcconnector",
            json!({"name": "c", "egress": "PRIVATE_RANGES_ONLY"}).as_object().unwrap().clone(),
        )]);
        assert_eq!(
            cf.config().get_path(&["cloudfunction", "serviceConfig", "vpcConnector"]).unwrap(),
            "c"
        );
    }
}
