//! Pub/Sub triggers: native Cloud Functions topic triggers or push
//! subscriptions against the backend endpoint.

use super::PubSubFn;
use crate::backends::{BackendKind, EventFunction};
use crate::cloud_actions::{create_pubsub_subscription, destroy_cloudfunction, destroy_pubsub_subscription};
use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::{attributes_match, attributes_to_filter, short_name, string_map};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goblet_gcp::{default_project_number, iam, list_all, Verb, PROJECT_SCHEMA};
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const LOCAL_ENV: &str = "X_GOBLET_LOCAL";
pub const LOCAL_URL_ENV: &str = "GOBLET_LOCAL_URL";
const DEFAULT_DLQ_ATTEMPTS: u32 = 5;

/// Registration options for a Pub/Sub handler.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Only messages carrying all of these attributes reach the function.
    pub attributes: BTreeMap<String, String>,
    /// Explicit subscription filter; derived from `attributes` when absent.
    pub filter: Option<String>,
    /// Project owning the topic, when it is not the app's.
    pub project: Option<String>,
    pub use_subscription: bool,
    /// Extra subscription fields, e.g. `ackDeadlineSeconds`.
    pub config: Map<String, Value>,
    /// Recreate instead of patching an existing subscription.
    pub force_update: bool,
    /// Dead-letter to `{topic}-dlq`.
    pub dlq: bool,
    pub dlq_max_delivery_attempts: Option<u32>,
}

impl SubscriptionOptions {
    pub fn subscription() -> Self {
        Self {
            use_subscription: true,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_dlq(mut self) -> Self {
        self.dlq = true;
        self
    }

    pub fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }
}

#[derive(Clone)]
struct PubSubEntry {
    function: PubSubFn,
    options: SubscriptionOptions,
}

#[derive(Clone, Default)]
struct TopicEntry {
    trigger: BTreeMap<String, PubSubEntry>,
    subscription: BTreeMap<String, PubSubEntry>,
}

pub struct PubSub {
    name: String,
    backend_kind: BackendKind,
    project: Option<String>,
    resources: BTreeMap<String, TopicEntry>,
    service_accounts: Vec<String>,
}

impl PubSub {
    pub fn new(app_name: &str, backend_kind: BackendKind, project: Option<&str>) -> Self {
        Self {
            name: app_name.to_string(),
            backend_kind,
            project: project.map(str::to_string),
            resources: BTreeMap::new(),
            service_accounts: Vec::new(),
        }
    }

    /// Subscriptions are used when asked for, across projects, and on
    /// Cloud Run, which has no native topic trigger.
    fn uses_subscription(&self, options: &SubscriptionOptions) -> bool {
        let cross_project = match (&options.project, &self.project) {
            (Some(theirs), Some(ours)) => theirs != ours,
            (Some(_), None) => true,
            _ => false,
        };
        options.use_subscription || cross_project || self.backend_kind == BackendKind::CloudRun
    }

    pub fn register(&mut self, name: &str, topic: &str, function: PubSubFn, mut options: SubscriptionOptions) {
        if options.filter.is_none() && !options.attributes.is_empty() {
            options.filter = Some(attributes_to_filter(&options.attributes));
        }
        let subscription = self.uses_subscription(&options);
        let entry = self.resources.entry(topic.to_string()).or_default();
        let target = if subscription {
            &mut entry.subscription
        } else {
            &mut entry.trigger
        };
        target.insert(name.to_string(), PubSubEntry { function, options });
    }

    pub fn merge(&mut self, other: &PubSub) {
        for (topic, entry) in &other.resources {
            let current = self.resources.entry(topic.clone()).or_default();
            current.trigger.extend(entry.trigger.clone());
            current.subscription.extend(entry.subscription.clone());
        }
    }

    /// A push subscription needs an HTTP backend.
    pub fn is_http(&self) -> bool {
        self.resources.values().any(|t| !t.subscription.is_empty())
    }

    fn subscription_name(&self, topic: &str) -> String {
        format!("{}-{}", self.name, topic)
    }

    fn push_service_account(&self, ctx: &DeployContext<'_>) -> GobletResult<String> {
        if let Some(sa) = ctx.config.get_path(&["pubsub", "serviceAccountEmail"]).and_then(|v| v.as_str()) {
            return Ok(sa.to_string());
        }
        ctx.backend()?.service_account().ok_or_else(|| {
            GobletError::validation(
                "Service account not found in cloudrun or cloudfunction. You can set `serviceAccountEmail` under `pubsub`",
            )
        })
    }

    /// Body of the push subscription for `topic`. A single registration
    /// contributes its filter; several share one unfiltered subscription.
    fn subscription_body(&self, ctx: &DeployContext<'_>, topic: &str, entries: &BTreeMap<String, PubSubEntry>, push_url: &str, service_account: &str) -> Map<String, Value> {
        let mut config = Map::new();
        for entry in entries.values() {
            config.extend(entry.options.config.clone());
        }
        let first = entries.values().next().map(|e| &e.options);
        let project = first
            .and_then(|o| o.project.clone())
            .unwrap_or_else(|| ctx.project().to_string());
        let filter = match (entries.len(), first) {
            (1, Some(o)) => o.filter.clone().unwrap_or_default(),
            _ => String::new(),
        };
        let exactly_once = config
            .get("enableExactlyOnceDelivery")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let push_config = if exactly_once {
            json!({})
        } else {
            json!({
                "pushEndpoint": push_url,
                "oidcToken": {"serviceAccountEmail": service_account, "audience": push_url},
            })
        };

        let mut body = Map::new();
        body.insert("topic".into(), json!(format!("projects/{}/topics/{}", project, topic)));
        body.insert("filter".into(), json!(filter));
        body.insert("pushConfig".into(), push_config);
        body.insert("labels".into(), Value::Object(ctx.config.labels()));
        body.extend(config);
        if let Some(o) = entries.values().map(|e| &e.options).find(|o| o.dlq) {
            if !body.contains_key("deadLetterPolicy") {
                body.insert(
                    "deadLetterPolicy".into(),
                    json!({
                        "deadLetterTopic": format!("projects/{}/topics/{}-dlq", project, topic),
                        "maxDeliveryAttempts": o.dlq_max_delivery_attempts.unwrap_or(DEFAULT_DLQ_ATTEMPTS),
                    }),
                );
            }
        }
        body
    }

    async fn deploy_subscription(&self, ctx: &DeployContext<'_>, topic: &str, entries: &BTreeMap<String, PubSubEntry>) -> GobletResult<String> {
        let sub_name = self.subscription_name(topic);
        info!(target: "goblet::deployer", "deploying pubsub subscription {}......", sub_name);
        let push_url = if std::env::var(LOCAL_ENV).map(|v| !v.is_empty()).unwrap_or(false) {
            std::env::var(LOCAL_URL_ENV).unwrap_or_else(|_| "http://localhost:8080".to_string())
        } else {
            ctx.backend()?.http_endpoint(ctx).await?
        };
        let service_account = self.push_service_account(ctx)?;
        let body = self.subscription_body(ctx, topic, entries, &push_url, &service_account);
        let dead_letter = body.contains_key("deadLetterPolicy");
        let force = entries.values().any(|e| e.options.force_update);
        create_pubsub_subscription(ctx, &sub_name, Value::Object(body), force).await?;

        if dead_letter {
            let number = default_project_number(ctx.api, ctx.clients).await?;
            let agent = format!("serviceAccount:service-{}@gcp-sa-pubsub.iam.gserviceaccount.com", number);
            let resource = format!("{}/subscriptions/{}", PROJECT_SCHEMA, sub_name);
            match iam::add_binding(ctx.api, &ctx.clients.pubsub(), &resource, "roles/pubsub.subscriber", &agent)
                .await
                .map_err(GobletError::from)
            {
                Ok(()) => {}
                Err(e) if e.is_permission_denied() => warn!(
                    target: "goblet::deployer",
                    "User is not authorized to add IAM role 'roles/pubsub.subscriber' to subscription '{}' you need to handle this manually.",
                    sub_name
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(service_account)
    }

    fn topic_trigger(&self, ctx: &DeployContext<'_>, topic: &str) -> Value {
        let resource = format!("projects/{}/topics/{}", ctx.project(), topic);
        match ctx.backend_kind {
            BackendKind::CloudFunction => json!({
                "eventType": "providers/cloud.pubsub/eventTypes/topic.publish",
                "resource": resource,
            }),
            _ => json!({
                "eventType": "google.cloud.pubsub.topic.v1.messagePublished",
                "pubsubTopic": resource,
            }),
        }
    }

    fn invoke(&self, topic_name: &str, data: &str, attributes: &BTreeMap<String, String>) -> GobletResult<Response> {
        let topic = self
            .resources
            .get(topic_name)
            .ok_or_else(|| GobletError::NotFound(format!("Topic {} not found", topic_name)))?;
        let mut results: Vec<Value> = topic
            .trigger
            .values()
            .chain(topic.subscription.values())
            .filter(|e| attributes_match(&e.options.attributes, attributes))
            .map(|e| (e.function)(data))
            .collect();
        Ok(match results.len() {
            0 => Response::from("success"),
            1 => Response::from(results.remove(0)),
            _ => Response::from(Value::Array(results)),
        })
    }
}

fn decode_data(data: Option<&Value>) -> GobletResult<String> {
    let encoded = data.and_then(|d| d.as_str()).unwrap_or_default();
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| GobletError::validation(format!("pubsub data is not base64: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl Resource for PubSub {
    fn resource_type(&self) -> &'static str {
        "pubsub"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["pubsub"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("pubsub", "subscriptions")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn can_sync(&self) -> bool {
        true
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let mut accounts = Vec::new();
        for (topic, entry) in &self.resources {
            if !entry.trigger.is_empty() {
                let function = EventFunction {
                    name: format!("{}-topic-{}", self.name, topic),
                    trigger: self.topic_trigger(ctx, topic),
                };
                info!(target: "goblet::deployer", "deploying topic function {}......", function.name);
                ctx.backend()?.deploy_event_function(ctx, &function).await?;
            }
            if !entry.subscription.is_empty() {
                accounts.push(self.deploy_subscription(ctx, topic, &entry.subscription).await?);
            }
        }
        accounts.dedup();
        self.service_accounts = accounts;
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for (topic, entry) in &self.resources {
            if !entry.trigger.is_empty() && ctx.backend_kind.is_cloudfunction() {
                destroy_cloudfunction(ctx, &format!("{}-topic-{}", self.name, topic)).await?;
            }
            if !entry.subscription.is_empty() {
                destroy_pubsub_subscription(ctx, &self.subscription_name(topic)).await?;
            }
        }
        Ok(())
    }

    async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        let subs = ctx.clients.pubsub();
        let call = subs.call(ctx.api.context(), &Verb::List, Some(PROJECT_SCHEMA), None, &[]);
        let prefix = format!("{}-", self.name);
        for sub in list_all(ctx.api, call, "subscriptions").await? {
            let Some(full) = sub.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(topic) = short_name(full).strip_prefix(&prefix) else {
                continue;
            };
            let registered = self
                .resources
                .get(topic)
                .map(|t| !t.subscription.is_empty())
                .unwrap_or(false);
            if !registered {
                info!(target: "goblet::deployer", "Detected unused subscription in GCP {}", full);
                if !dryrun {
                    destroy_pubsub_subscription(ctx, short_name(full)).await?;
                }
            }
        }
        Ok(())
    }
}

impl Handler for PubSub {
    fn dispatch(&self, request: &Request, context: Option<&EventContext>) -> GobletResult<Response> {
        let body = request.json_object();
        match context {
            // native trigger: the event is the message
            Some(ctx) => {
                let topic = short_name(&ctx.resource).to_string();
                let data = decode_data(body.and_then(|b| b.get("data")))?;
                let attributes = string_map(body.and_then(|b| b.get("attributes")));
                self.invoke(&topic, &data, &attributes)
            }
            None => {
                let subscription = body
                    .and_then(|b| b.get("subscription"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let sub_id = short_name(subscription);
                let prefix = format!("{}-", self.name);
                let topic = sub_id.strip_prefix(&prefix).unwrap_or(sub_id);
                let message = body.and_then(|b| b.get("message"));
                let data = decode_data(message.and_then(|m| m.get("data")))?;
                let attributes = string_map(message.and_then(|m| m.get("attributes")));
                self.invoke(topic, &data, &attributes)
            }
        }
    }

    fn service_accounts(&self, _config: &GConfig) -> Vec<String> {
        self.service_accounts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Backend, CloudFunctionV1, StaticSource};
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};
    use std::sync::Arc;

    fn tagged(tag: &'static str) -> PubSubFn {
        Arc::new(move |data: &str| json!(format!("{}:{}", tag, data)))
    }

    fn push(sub: &str, data: &str, attributes: Value) -> Request {
        Request::post("/").with_json(json!({
            "subscription": sub,
            "message": {"data": STANDARD.encode(data), "attributes": attributes},
        }))
    }

    #[test]
    fn test_attribute_subset_dispatch() {
        let mut ps = PubSub::new("app", BackendKind::CloudRun, Some("proj"));
        ps.register("any", "t", tagged("any"), SubscriptionOptions::default());
        ps.register("prod", "t", tagged("prod"), SubscriptionOptions::default().with_attribute("env", "prod"));
        ps.register("dev", "t", tagged("dev"), SubscriptionOptions::default().with_attribute("env", "dev"));

        let resp = ps
            .dispatch(&push("projects/proj/subscriptions/app-t", "hi", json!({"env": "prod", "x": "1"})), None)
            .unwrap();
        let results = resp.body.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.contains(&json!("prod:hi")));
        assert!(results.contains(&json!("any:hi")));

        let resp = ps.dispatch(&push("projects/proj/subscriptions/app-t", "hi", json!({})), None).unwrap();
        assert_eq!(resp.body, json!("any:hi"));
        assert!(ps.dispatch(&push("projects/proj/subscriptions/app-zzz", "hi", json!({})), None).is_err());
    }

    #[test]
    fn test_trigger_form_and_no_match() {
        let mut ps = PubSub::new("app", BackendKind::CloudFunction, Some("proj"));
        ps.register("f", "t", tagged("f"), SubscriptionOptions::default().with_attribute("k", "v"));
        assert!(!ps.is_http());
        let event = Request::event(json!({"data": STANDARD.encode("x"), "attributes": {"k": "v"}}));
        let ctx = EventContext::new("google.pubsub.topic.publish", "projects/proj/topics/t");
        assert_eq!(ps.dispatch(&event, Some(&ctx)).unwrap().body, json!("f:x"));

        let event = Request::event(json!({"data": STANDARD.encode("x")}));
        assert_eq!(ps.dispatch(&event, Some(&ctx)).unwrap().body, json!("success"));
    }

    #[test]
    fn test_subscription_selection() {
        let mut ps = PubSub::new("app", BackendKind::CloudFunction, Some("proj"));
        ps.register("a", "t1", tagged("a"), SubscriptionOptions::default());
        assert!(!ps.is_http());
        ps.register("b", "t2", tagged("b"), SubscriptionOptions::default().with_project("other"));
        assert!(ps.is_http());
    }

    #[tokio::test]
    async fn test_subscription_with_dlq() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(HttpMethod::Get, "functions/app", json!({"httpsTrigger": {"url": "https://fn"}}));
        cloud.fail(HttpMethod::Post, "subscriptions/app-t:setIamPolicy", 403);
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"pubsub": {"serviceAccountEmail": "sa@p.iam.gserviceaccount.com"}}));
        let backend = CloudFunctionV1::new("app", config.clone(), Arc::new(StaticSource(vec![])));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudFunction)
            .with_backend(&backend as &dyn Backend);

        let mut ps = PubSub::new("app", BackendKind::CloudFunction, Some("proj"));
        ps.register(
            "f",
            "t",
            tagged("f"),
            SubscriptionOptions::subscription().with_attribute("k", "v").with_dlq(),
        );
        ps.deploy(&ctx).await.unwrap();

        let put = cloud.calls_to(HttpMethod::Put, "subscriptions/app-t");
        let body = put[0].body.clone().unwrap();
        assert_eq!(body["topic"], "projects/proj/topics/t");
        assert_eq!(body["filter"], "attributes.k = \"v\"");
        assert_eq!(body["pushConfig"]["pushEndpoint"], "https://us-central1-proj.cloudfunctions.net/app");
        assert_eq!(body["pushConfig"]["oidcToken"]["serviceAccountEmail"], "sa@p.iam.gserviceaccount.com");
        assert_eq!(body["deadLetterPolicy"]["deadLetterTopic"], "projects/proj/topics/t-dlq");
        assert_eq!(cloud.count(HttpMethod::Get, "subscriptions/app-t:getIamPolicy"), 1);
        assert_eq!(ps.service_accounts(&config), vec!["sa@p.iam.gserviceaccount.com".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_only_touches_app_prefix() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "v1/projects/proj/subscriptions",
            json!({"subscriptions": [
                {"name": "projects/proj/subscriptions/app-t"},
                {"name": "projects/proj/subscriptions/app-old"},
                {"name": "projects/proj/subscriptions/other-old"},
            ]}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut ps = PubSub::new("app", BackendKind::CloudRun, Some("proj"));
        ps.register("f", "t", tagged("f"), SubscriptionOptions::default());

        ps.sync(&ctx, true).await.unwrap();
        assert!(cloud.writes().is_empty());
        ps.sync(&ctx, false).await.unwrap();
        let deletes = cloud.calls_to(HttpMethod::Delete, "subscriptions");
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].path.ends_with("subscriptions/app-old"));
    }
}
