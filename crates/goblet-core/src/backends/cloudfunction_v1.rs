//! Cloud Functions (1st gen) backend.

use super::{
    infra_environment, infra_vpc_connector, parse_seconds, resolve_function_secrets, source_checksum,
    Backend, BackendKind, EventFunction, SourceHandle, SourcePackager, ENTRY_POINT,
};
use crate::cloud_actions::{
    create_cloudfunction, deployed_function_checksum, destroy_cloudfunction,
    destroy_cloudfunction_artifacts, function_path, function_runtime, get_cloudfunction_url,
    upload_function_source,
};
use crate::config::GConfig;
use crate::error::GobletResult;
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig};
use async_trait::async_trait;
use goblet_gcp::iam;
use log::info;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const CONFIG_KEY: &str = "cloudfunction";

pub struct CloudFunctionV1 {
    name: String,
    config: GConfig,
    packager: Arc<dyn SourcePackager>,
    source: Option<SourceHandle>,
}

impl CloudFunctionV1 {
    pub fn new(name: &str, config: GConfig, packager: Arc<dyn SourcePackager>) -> Self {
        Self {
            name: name.to_string(),
            config,
            packager,
            source: None,
        }
    }

    fn function_body(
        &self,
        ctx: &DeployContext<'_>,
        name: &str,
        source: &SourceHandle,
        trigger: (&str, Value),
    ) -> GobletResult<Value> {
        let mut body = Map::new();
        body.insert("name".into(), json!(function_path(ctx, name)));
        body.insert(
            "description".into(),
            json!(self.config.str_value("description").unwrap_or_else(|| "created by goblet".into())),
        );
        body.insert("entryPoint".into(), json!(ENTRY_POINT));
        body.insert("sourceUploadUrl".into(), json!(source.upload_url));
        body.insert(trigger.0.into(), trigger.1);
        body.insert("runtime".into(), json!(function_runtime(&self.config, "v1")?));
        body.insert("labels".into(), Value::Object(self.config.labels()));
        for (k, v) in self.config.section(CONFIG_KEY) {
            body.insert(k, v);
        }
        Ok(Value::Object(body))
    }
}

/// Package the source; `None` when the deployed function already runs it.
pub(crate) async fn stage_source(
    ctx: &DeployContext<'_>,
    name: &str,
    archive: Vec<u8>,
    headers: &[(String, String)],
    force: bool,
) -> GobletResult<Option<SourceHandle>> {
    info!(target: "goblet::deployer", "zipping source code");
    let checksum = source_checksum(&archive);
    if !force {
        if let Some(deployed) = deployed_function_checksum(ctx, name).await? {
            if deployed == checksum {
                info!(target: "goblet::deployer", "No changes detected....");
                return Ok(None);
            }
        }
    }
    Ok(Some(upload_function_source(ctx, archive, headers, checksum).await?))
}

/// `serviceAccount:` prefix unless the principal is already typed.
pub(crate) fn member(principal: &str) -> String {
    if principal.contains(':') {
        principal.to_string()
    } else {
        format!("serviceAccount:{}", principal)
    }
}

#[async_trait]
impl Backend for CloudFunctionV1 {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudFunction
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &GConfig {
        &self.config
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudfunctions"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("cloudfunctions", "functions");
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
        self.config
            .get_path(&[CONFIG_KEY, "serviceAccountEmail"])
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn timeout_secs(&self) -> Option<u64> {
        parse_seconds(self.config.get_path(&[CONFIG_KEY, "timeout"]))
    }

    async fn deploy(
        &mut self,
        ctx: &DeployContext<'_>,
        force: bool,
        http: bool,
    ) -> GobletResult<Option<SourceHandle>> {
        let archive = self.packager.package(&self.config)?;
        let headers = vec![
            ("content-type".to_string(), "application/zip".to_string()),
            ("x-goog-content-length-range".to_string(), "0,104857600".to_string()),
        ];
        self.source = stage_source(ctx, &self.name, archive, &headers, force).await?;
        let Some(source) = self.source.clone() else {
            return Ok(None);
        };
        if http {
            let body = self.function_body(ctx, &self.name, &source, ("httpsTrigger", json!({})))?;
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
        let mut env = self
            .config
            .get_path(&[CONFIG_KEY, "environmentVariables"])
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        resolve_function_secrets(
            ctx,
            self.config.get_path(&[CONFIG_KEY, "secretEnvironmentVariables"]),
            &mut env,
        )
        .await?;
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
        let mut section = Map::new();
        if let Some((name, egress)) = infra_vpc_connector(infra_configs) {
            section.insert("vpcConnector".into(), name);
            section.insert("vpcConnectorEgressSettings".into(), egress);
        }
        let env = infra_environment(infra_configs);
        if !env.is_empty() {
            section.insert("environmentVariables".into(), Value::Object(env));
        }
        if !section.is_empty() {
            self.config = self.config.with_overlay(&json!({ CONFIG_KEY: section }));
        }
    }

    async fn deploy_event_function(&self, ctx: &DeployContext<'_>, function: &EventFunction) -> GobletResult<()> {
        let Some(source) = self.source.as_ref() else {
            info!(target: "goblet::deployer", "source unchanged, skipping function {}", function.name);
            return Ok(());
        };
        let body = self.function_body(ctx, &function.name, source, ("eventTrigger", function.trigger.clone()))?;
        create_cloudfunction(ctx, body, &self.config).await
    }
}
