//! Serverless VPC access connector routing backend egress to a network.

use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig, Infrastructure, Resource};
use async_trait::async_trait;
use goblet_gcp::{Verb, LOCATION_SCHEMA};
use log::info;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default)]
pub struct VpcConnector {
    name: Option<String>,
    ip_cidr_range: Option<String>,
}

impl VpcConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ip_cidr_range` may instead come from `vpcconnector.ipCidrRange`.
    pub fn register(&mut self, name: &str, ip_cidr_range: Option<&str>) {
        self.name = Some(name.to_string());
        self.ip_cidr_range = ip_cidr_range.map(str::to_string);
    }

    pub fn merge(&mut self, other: &VpcConnector) {
        if other.name.is_some() {
            *self = other.clone();
        }
    }

    fn connector_path(name: &str) -> String {
        format!("{}/connectors/{}", LOCATION_SCHEMA, name)
    }

    pub fn connector_body(&self, ctx: &DeployContext<'_>) -> GobletResult<Value> {
        let user = ctx.config.section("vpcconnector");
        let cidr = self
            .ip_cidr_range
            .clone()
            .or_else(|| user.get("ipCidrRange").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| GobletError::validation("ipCidrRange is required for a vpc connector"))?;
        let min = user.get("minInstances").and_then(|v| v.as_u64()).unwrap_or(2);
        let mut body = Map::new();
        body.insert("network".into(), json!("default"));
        body.insert("minInstances".into(), json!(min));
        body.insert("maxInstances".into(), json!(min + 1));
        for (k, v) in user {
            body.insert(k, v);
        }
        body.insert("ipCidrRange".into(), json!(cidr));
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl Resource for VpcConnector {
    fn resource_type(&self) -> &'static str {
        "vpcconnector"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["vpcaccess"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("vpcaccess", "connectors");
        perms.push("vpcaccess.connectors.use".to_string());
        perms
    }

    fn is_empty(&self) -> bool {
        self.name.is_none()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let Some(ref name) = self.name else {
            return Ok(());
        };
        let body = self.connector_body(ctx)?;
        let connectors = ctx.clients.vpcconnector();
        match connectors
            .execute(ctx.api, Verb::Create, None, Some(body), &[("connectorId", name)])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                info!(target: "goblet::deployer", "creating vpc connector {}", name);
                connectors.wait_for_operation(ctx.api, &op, ctx.poll).await?;
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "vpc connector already exists, updating not supported");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let Some(ref name) = self.name else {
            return Ok(());
        };
        let connectors = ctx.clients.vpcconnector();
        match connectors
            .execute(ctx.api, Verb::Delete, Some(&Self::connector_path(name)), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                info!(target: "goblet::deployer", "destroying vpc connector");
                connectors.wait_for_operation(ctx.api, &op, ctx.poll).await?;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "vpc connector already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Infrastructure for VpcConnector {
    async fn get_config(&self, ctx: &DeployContext<'_>) -> GobletResult<Option<InfraConfig>> {
        let Some(ref name) = self.name else {
            return Ok(None);
        };
        let live = ctx
            .clients
            .vpcconnector()
            .execute(ctx.api, Verb::Get, Some(&Self::connector_path(name)), None, &[])
            .await?;
        let full_name = live
            .get("name")
            .cloned()
            .unwrap_or_else(|| Value::String(ctx.render(&Self::connector_path(name))));
        let mut values = Map::new();
        values.insert("name".into(), full_name);
        values.insert("egress".into(), json!("PRIVATE_RANGES_ONLY"));
        Ok(Some(InfraConfig::new("vpcconnector", values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::config::GConfig;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};

    #[test]
    fn test_missing_cidr_is_validation_error() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut vpc = VpcConnector::new();
        vpc.register("conn", None);
        assert!(matches!(vpc.connector_body(&ctx), Err(GobletError::Validation(_))));
    }

    #[test]
    fn test_instance_defaults() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"vpcconnector": {"minInstances": 3}}));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut vpc = VpcConnector::new();
        vpc.register("conn", Some("10.8.0.0/28"));
        let body = vpc.connector_body(&ctx).unwrap();
        assert_eq!(body["network"], "default");
        assert_eq!(body["minInstances"], 3);
        assert_eq!(body["maxInstances"], 4);
        assert_eq!(body["ipCidrRange"], "10.8.0.0/28");
    }

    #[tokio::test]
    async fn test_existing_connector_is_left_alone() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Post, "connectors", 409);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut vpc = VpcConnector::new();
        vpc.register("conn", Some("10.8.0.0/28"));
        vpc.deploy(&ctx).await.unwrap();
        assert_eq!(cloud.writes().len(), 1);

        let infra = vpc.get_config(&ctx).await.unwrap().unwrap();
        assert_eq!(infra.values["name"], "projects/proj/locations/us-central1/connectors/conn");
        assert_eq!(infra.values["egress"], "PRIVATE_RANGES_ONLY");
    }
}
