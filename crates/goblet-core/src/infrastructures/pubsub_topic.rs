//! Pub/Sub topics owned by the app, with an optional dead-letter topic.

use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, Infrastructure, Resource};
use crate::utils::changed_keys;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goblet_gcp::{default_project_number, iam, CloudApi, Verb, VersionedClients, PROJECT_SCHEMA};
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn topic_schema(name: &str) -> String {
    format!("{}/topics/{}", PROJECT_SCHEMA, name)
}

/// Publishes JSON messages to one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubClient {
    /// `projects/{project_id}/topics/{name}`, rendered at publish time.
    pub topic: String,
}

impl PubSubClient {
    /// The `topics.publish` body: one message, JSON encoded then base64.
    pub fn publish_body(message: &Value) -> Value {
        json!({"messages": [{"data": STANDARD.encode(message.to_string())}]})
    }

    pub async fn publish(&self, api: &dyn CloudApi, clients: &VersionedClients, message: &Value) -> GobletResult<Value> {
        Ok(clients
            .pubsub_topic()
            .execute(api, Verb::Custom("publish"), Some(&self.topic), Some(Self::publish_body(message)), &[])
            .await?)
    }
}

#[derive(Debug, Clone, Default)]
struct TopicEntry {
    config: Map<String, Value>,
    dlq: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PubSubTopics {
    resources: BTreeMap<String, TopicEntry>,
}

impl PubSubTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register topic `name`; `dlq` also provisions `{name}-dlq`.
    pub fn register(&mut self, name: &str, config: Map<String, Value>, dlq: bool) -> PubSubClient {
        self.resources.insert(name.to_string(), TopicEntry { config, dlq });
        PubSubClient {
            topic: topic_schema(name),
        }
    }

    pub fn merge(&mut self, other: &PubSubTopics) {
        self.resources.extend(other.resources.clone());
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Create the topic or patch whatever differs from the live one.
    async fn deploy_topic(&self, ctx: &DeployContext<'_>, name: &str, config: &Map<String, Value>) -> GobletResult<()> {
        let topics = ctx.clients.pubsub_topic();
        let path = topic_schema(name);
        let mut body = config.clone();
        body.insert("name".into(), Value::String(ctx.render(&path)));
        match topics
            .execute(ctx.api, Verb::Put, Some(&path), Some(Value::Object(body.clone())), &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "PubSub Topic [{}] deployed", name);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let live = topics.execute(ctx.api, Verb::Get, Some(&path), None, &[]).await?;
                let changed = changed_keys(&body, &live, &["name"]);
                if changed.is_empty() {
                    info!(target: "goblet::deployer", "found pubsub topic {}, no changes", name);
                    return Ok(());
                }
                let mask = changed.join(",");
                topics
                    .execute(
                        ctx.api,
                        Verb::Patch,
                        Some(&path),
                        Some(json!({"topic": body, "updateMask": mask})),
                        &[],
                    )
                    .await?;
                info!(target: "goblet::deployer", "updated pubsub topic {} fields {}", name, mask);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `{name}-dlq`, a pull subscription on it, and publish rights for the
    /// Pub/Sub service agent.
    async fn deploy_dlq(&self, ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
        let dlq = format!("{}-dlq", name);
        self.deploy_topic(ctx, &dlq, &Map::new()).await?;

        let pull = format!("{}-pull", dlq);
        let sub_path = format!("{}/subscriptions/{}", PROJECT_SCHEMA, pull);
        match ctx
            .clients
            .pubsub()
            .execute(
                ctx.api,
                Verb::Put,
                Some(&sub_path),
                Some(json!({"topic": ctx.render(&topic_schema(&dlq))})),
                &[],
            )
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => info!(target: "goblet::deployer", "created dlq pull subscription {}", pull),
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "dlq pull subscription {} already exists", pull)
            }
            Err(e) => return Err(e),
        }

        let number = default_project_number(ctx.api, ctx.clients).await?;
        let agent = format!("serviceAccount:service-{}@gcp-sa-pubsub.iam.gserviceaccount.com", number);
        match iam::add_binding(
            ctx.api,
            &ctx.clients.pubsub_topic(),
            &topic_schema(&dlq),
            "roles/pubsub.publisher",
            &agent,
        )
        .await
        .map_err(GobletError::from)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_permission_denied() => {
                warn!(
                    target: "goblet::deployer",
                    "User is not authorized to add IAM role 'roles/pubsub.publisher' to topic '{}' you need to handle this manually.",
                    dlq
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_topic(&self, ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
        match ctx
            .clients
            .pubsub_topic()
            .execute(ctx.api, Verb::Delete, Some(&topic_schema(name)), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "PubSub Topic [{}] destroyed", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "PubSub Topic {} already destroyed", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Resource for PubSubTopics {
    fn resource_type(&self) -> &'static str {
        "pubsub_topic"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["pubsub"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("pubsub", "topics")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for (name, entry) in &self.resources {
            self.deploy_topic(ctx, name, &entry.config).await?;
            if entry.dlq {
                self.deploy_dlq(ctx, name).await?;
            }
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for (name, entry) in &self.resources {
            self.delete_topic(ctx, name).await?;
            if entry.dlq {
                let pull = format!("projects/{{project_id}}/subscriptions/{}-dlq-pull", name);
                match ctx
                    .clients
                    .pubsub()
                    .execute(ctx.api, Verb::Delete, Some(&pull), None, &[])
                    .await
                    .map_err(GobletError::from)
                {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.delete_topic(ctx, &format!("{}-dlq", name)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for PubSubTopics {}
