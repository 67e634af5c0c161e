//! Memorystore Redis instance; its address is exported to the backend as
//! environment variables.

use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig, Infrastructure, Resource};
use async_trait::async_trait;
use goblet_gcp::{Verb, LOCATION_SCHEMA};
use log::info;
use serde_json::{json, Map, Value};

const UPDATE_KEYS: &[&str] = &["displayName", "labels", "memorySizeGb", "replicaCount"];

#[derive(Debug, Clone, Default)]
pub struct Redis {
    instance: Option<String>,
}

impl Redis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) {
        self.instance = Some(name.to_string());
    }

    pub fn merge(&mut self, other: &Redis) {
        if other.instance.is_some() {
            self.instance = other.instance.clone();
        }
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    fn instance_path(name: &str) -> String {
        format!("{}/instances/{}", LOCATION_SCHEMA, name)
    }

    /// Defaults (`BASIC`, 1 GB) under the `redis` config section.
    pub fn instance_body(ctx: &DeployContext<'_>) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("tier".into(), json!("BASIC"));
        body.insert("memorySizeGb".into(), json!(1));
        for (k, v) in ctx.config.section("redis") {
            body.insert(k, v);
        }
        body
    }

    /// Patchable keys the user actually set; a BASIC tier has no replicas.
    pub fn update_mask(ctx: &DeployContext<'_>, body: &Map<String, Value>) -> String {
        let user = ctx.config.section("redis");
        let basic = body.get("tier").and_then(|v| v.as_str()) == Some("BASIC");
        UPDATE_KEYS
            .iter()
            .filter(|k| user.contains_key(**k))
            .filter(|k| !(basic && **k == "replicaCount"))
            .copied()
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl Resource for Redis {
    fn resource_type(&self) -> &'static str {
        "redis"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["redis"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("redis", "instances")
    }

    fn is_empty(&self) -> bool {
        self.instance.is_none()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let Some(ref name) = self.instance else {
            return Ok(());
        };
        let redis = ctx.clients.redis();
        let body = Self::instance_body(ctx);
        let op = match redis
            .execute(ctx.api, Verb::Create, None, Some(Value::Object(body.clone())), &[("instanceId", name)])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                info!(target: "goblet::deployer", "creating redis {}", name);
                op
            }
            Err(e) if e.is_already_exists() => {
                let mask = Self::update_mask(ctx, &body);
                if mask.is_empty() {
                    info!(target: "goblet::deployer", "redis {} already exists", name);
                    return Ok(());
                }
                info!(target: "goblet::deployer", "updating redis {}", name);
                redis
                    .execute(
                        ctx.api,
                        Verb::Patch,
                        Some(&Self::instance_path(name)),
                        Some(Value::Object(body)),
                        &[("updateMask", mask.as_str())],
                    )
                    .await?
            }
            Err(e) => return Err(e),
        };
        redis.wait_for_operation(ctx.api, &op, ctx.poll).await?;
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let Some(ref name) = self.instance else {
            return Ok(());
        };
        let redis = ctx.clients.redis();
        match redis
            .execute(ctx.api, Verb::Delete, Some(&Self::instance_path(name)), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(op) => {
                info!(target: "goblet::deployer", "destroying redis {}", name);
                redis.wait_for_operation(ctx.api, &op, ctx.poll).await?;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "redis {} already destroyed", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Infrastructure for Redis {
    async fn get_config(&self, ctx: &DeployContext<'_>) -> GobletResult<Option<InfraConfig>> {
        let Some(ref name) = self.instance else {
            return Ok(None);
        };
        let live = ctx
            .clients
            .redis()
            .execute(ctx.api, Verb::Get, Some(&Self::instance_path(name)), None, &[])
            .await?;
        let field = |key: &str| match live.get(key) {
            Some(Value::String(s)) => Value::String(s.clone()),
            Some(Value::Number(n)) => Value::String(n.to_string()),
            _ => Value::String(String::new()),
        };
        let mut values = Map::new();
        values.insert("REDIS_INSTANCE_NAME".into(), field("name"));
        values.insert("REDIS_HOST".into(), field("host"));
        values.insert("REDIS_PORT".into(), field("port"));
        Ok(Some(InfraConfig::new("redis", values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::config::GConfig;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};

    #[tokio::test]
    async fn test_create_with_defaults() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut redis = Redis::new();
        redis.register("cache");
        redis.deploy(&ctx).await.unwrap();

        let create = cloud.calls_to(HttpMethod::Post, "locations/us-central1/instances");
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].query_value("instanceId"), Some("cache"));
        let body = create[0].body.clone().unwrap();
        assert_eq!(body["tier"], "BASIC");
        assert_eq!(body["memorySizeGb"], 1);
    }

    #[tokio::test]
    async fn test_existing_instance_patches_user_keys() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Post, "instances", 409);
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"redis": {"memorySizeGb": 4, "replicaCount": 2, "labels": {"a": "b"}}}));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut redis = Redis::new();
        redis.register("cache");
        redis.deploy(&ctx).await.unwrap();

        let patch = cloud.calls_to(HttpMethod::Patch, "instances/cache");
        assert_eq!(patch[0].query_value("updateMask"), Some("labels,memorySizeGb"));
    }

    #[tokio::test]
    async fn test_config_exports_address() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "instances/cache",
            json!({"name": "projects/proj/locations/us-central1/instances/cache", "host": "10.0.0.3", "port": 6379}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut redis = Redis::new();
        assert!(redis.get_config(&ctx).await.unwrap().is_none());
        redis.register("cache");
        let infra = redis.get_config(&ctx).await.unwrap().unwrap();
        assert_eq!(infra.resource_type, "redis");
        assert_eq!(infra.values["REDIS_HOST"], "10.0.0.3");
        assert_eq!(infra.values["REDIS_PORT"], "6379");
    }
}
