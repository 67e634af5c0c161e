//! API Gateway: API → versioned API config → gateway.

use crate::config::goblet_dir;
use crate::error::{GobletError, GobletResult};
use crate::openapi::OpenApiSpec;
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, Infrastructure, Resource};
use crate::utils::hyphenate;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goblet_gcp::{list_all, Verb, GLOBAL_SCHEMA, LOCATION_SCHEMA};
use log::info;
use serde_json::{json, Value};

// ── Cloud Actions ───────────────────────────────────────────────────────

fn api_schema(name: &str) -> String {
    format!("{}/apis/{}", GLOBAL_SCHEMA, name)
}

fn gateway_schema(name: &str) -> String {
    format!("{}/gateways/{}", LOCATION_SCHEMA, name)
}

/// Config id for the next rollout: `{name}` first, then `{name}-v{n}`.
pub fn next_config_id(name: &str, existing: usize) -> String {
    if existing == 0 {
        name.to_string()
    } else {
        format!("{}-v{}", name, existing)
    }
}

/// Create or update the API, a new API config carrying `document`, and the
/// gateway serving it. Each step waits on its operation.
pub async fn deploy_apigateway(ctx: &DeployContext<'_>, name: &str, document: &str, file_name: &str) -> GobletResult<()> {
    let labels = Value::Object(ctx.config.labels());
    let apis = ctx.clients.apigateway_api();
    match apis
        .execute(ctx.api, Verb::Create, None, Some(json!({"labels": labels})), &[("apiId", name)])
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            info!(target: "goblet::deployer", "creating api {}", name);
            apis.wait_for_operation(ctx.api, &op, ctx.poll).await?;
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "api {} already exists", name);
        }
        Err(e) => return Err(e),
    }

    let configs = ctx.clients.apigateway_configs();
    let list = configs.call(ctx.api.context(), &Verb::List, Some(&api_schema(name)), None, &[]);
    let existing = list_all(ctx.api, list, "apiConfigs").await?;
    let config_id = next_config_id(name, existing.len());
    let mut config_body = json!({
        "openapiDocuments": [{
            "document": {
                "path": file_name,
                "contents": STANDARD.encode(document.as_bytes()),
            }
        }],
        "labels": labels,
    });
    crate::config::deep_merge(&mut config_body, &Value::Object(ctx.config.section("apiConfig")));
    let op = configs
        .execute(
            ctx.api,
            Verb::Create,
            Some(&api_schema(name)),
            Some(config_body),
            &[("apiConfigId", config_id.as_str())],
        )
        .await?;
    info!(target: "goblet::deployer", "creating api config {}", config_id);
    configs.wait_for_operation(ctx.api, &op, ctx.poll).await?;

    let gateways = ctx.clients.apigateway();
    let api_config = format!("projects/{}/locations/global/apis/{}/configs/{}", ctx.project(), name, config_id);
    let gateway = json!({"apiConfig": api_config, "labels": labels});
    let op = match gateways
        .execute(ctx.api, Verb::Create, None, Some(gateway.clone()), &[("gatewayId", name)])
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            info!(target: "goblet::deployer", "creating api gateway {}", name);
            op
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating api gateway {}", name);
            gateways
                .execute(
                    ctx.api,
                    Verb::Patch,
                    Some(&gateway_schema(name)),
                    Some(gateway),
                    &[("updateMask", "apiConfig")],
                )
                .await?
        }
        Err(e) => return Err(e),
    };
    gateways.wait_for_operation(ctx.api, &op, ctx.poll).await?;

    let deployed = gateways
        .execute(ctx.api, Verb::Get, Some(&gateway_schema(name)), None, &[])
        .await?;
    if let Some(host) = deployed.get("defaultHostname").and_then(|v| v.as_str()) {
        info!(target: "goblet::deployer", "api endpoint is {}", host);
    }
    Ok(())
}

async fn delete_waiting(ctx: &DeployContext<'_>, collection: &goblet_gcp::Collection, path: &str) -> GobletResult<()> {
    match collection
        .execute(ctx.api, Verb::Delete, Some(path), None, &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            collection.wait_for_operation(ctx.api, &op, ctx.poll).await?;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(target: "goblet::deployer", "{} already destroyed", ctx.render(path));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete the gateway, every API config, then the API.
pub async fn destroy_apigateway(ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
    info!(target: "goblet::deployer", "destroying api gateway......");
    delete_waiting(ctx, &ctx.clients.apigateway(), &gateway_schema(name)).await?;

    let configs = ctx.clients.apigateway_configs();
    let list = configs.call(ctx.api.context(), &Verb::List, Some(&api_schema(name)), None, &[]);
    let existing = match list_all(ctx.api, list, "apiConfigs").await.map_err(GobletError::from) {
        Ok(existing) => existing,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e),
    };
    for config in existing {
        if let Some(config_name) = config.get("name").and_then(|v| v.as_str()) {
            delete_waiting(ctx, &configs, config_name).await?;
        }
    }

    delete_waiting(ctx, &ctx.clients.apigateway_api(), &api_schema(name)).await?;
    info!(target: "goblet::deployer", "api gateway successfully destroyed......");
    Ok(())
}

// ── Infrastructure ──────────────────────────────────────────────────────

/// A gateway deployed from a user-supplied swagger document.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResource {
    pub name: String,
    pub backend_url: String,
    pub openapi: Value,
}

#[derive(Debug, Default)]
pub struct ApiGateway {
    resource: Option<GatewayResource>,
}

impl ApiGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, backend_url: &str, openapi: Value) {
        self.resource = Some(GatewayResource {
            name: hyphenate(name),
            backend_url: backend_url.to_string(),
            openapi,
        });
    }

    pub fn resource(&self) -> Option<&GatewayResource> {
        self.resource.as_ref()
    }

    pub fn merge(&mut self, other: &ApiGateway) {
        if other.resource.is_some() {
            self.resource = other.resource.clone();
        }
    }
}

#[async_trait]
impl Resource for ApiGateway {
    fn resource_type(&self) -> &'static str {
        "apigateway"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["apigateway"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = vec!["apigateway.operations.get".to_string()];
        perms.extend(gcp_generic_resource_permissions("apigateway", "apiconfigs"));
        perms.extend(gcp_generic_resource_permissions("apigateway", "apis"));
        perms.extend(gcp_generic_resource_permissions("apigateway", "gateways"));
        perms
    }

    fn is_empty(&self) -> bool {
        self.resource.is_none()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let Some(ref gateway) = self.resource else {
            return Ok(());
        };
        let deadline = ctx
            .config
            .get_path(&["api_gateway", "deadline"])
            .and_then(|v| v.as_u64())
            .unwrap_or(15);
        let mut spec = OpenApiSpec::from_existing(&gateway.name, &gateway.backend_url, deadline, gateway.openapi.clone())?;
        spec.add_x_google_backend();
        let path = spec.write(&goblet_dir(ctx.root))?;
        deploy_apigateway(ctx, &gateway.name, &spec.to_yaml()?, &path.to_string_lossy()).await
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        match self.resource {
            Some(ref gateway) => destroy_apigateway(ctx, &gateway.name).await,
            None => Ok(()),
        }
    }
}

impl Infrastructure for ApiGateway {}
