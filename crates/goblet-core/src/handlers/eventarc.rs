//! Eventarc triggers routed to the Cloud Run service under
//! `/x-goblet-eventarc-triggers/{trigger}`.

use super::RequestFn;
use crate::backends::BackendKind;
use crate::cloud_actions::{create_eventarc_trigger, destroy_eventarc_trigger};
use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::{hyphenate, short_name};
use async_trait::async_trait;
use goblet_gcp::{list_all, Verb};
use log::info;
use serde_json::{json, Map, Value};

pub const TRIGGER_PATH_PREFIX: &str = "/x-goblet-eventarc-triggers/";
const PUBSUB_PUBLISHED: &str = "google.cloud.pubsub.topic.v1.messagePublished";

#[derive(Debug, Clone, Default)]
pub struct EventarcOptions {
    /// `{attribute, value[, operator]}` filters.
    pub event_filters: Vec<Value>,
    /// Deliver messages published to this topic.
    pub topic: Option<String>,
    /// Defaults to the deploy location.
    pub region: Option<String>,
    /// Defaults to `application/json`.
    pub content_type: Option<String>,
}

impl EventarcOptions {
    pub fn filter(mut self, attribute: &str, value: &str) -> Self {
        self.event_filters.push(json!({"attribute": attribute, "value": value}));
        self
    }

    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }
}

#[derive(Clone)]
struct Trigger {
    trigger_name: String,
    options: EventarcOptions,
    function: RequestFn,
}

impl Trigger {
    fn region<'a>(&'a self, ctx: &DeployContext<'a>) -> &'a str {
        self.options.region.as_deref().unwrap_or_else(|| ctx.location())
    }

    fn event_filters(&self) -> Vec<Value> {
        let mut filters = self.options.event_filters.clone();
        let has_type = filters.iter().any(|f| f.get("attribute") == Some(&json!("type")));
        if self.options.topic.is_some() && !has_type {
            filters.push(json!({"attribute": "type", "value": PUBSUB_PUBLISHED}));
        }
        filters
    }
}

pub struct Eventarc {
    name: String,
    resources: Vec<Trigger>,
    service_accounts: Vec<String>,
}

impl Eventarc {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: Vec::new(),
            service_accounts: Vec::new(),
        }
    }

    /// Register `function` as trigger `{app}-{name}`. Returns the trigger name.
    pub fn register(&mut self, name: &str, function: RequestFn, options: EventarcOptions) -> String {
        let trigger_name = hyphenate(&format!("{}-{}", self.name, name));
        self.resources.push(Trigger {
            trigger_name: trigger_name.clone(),
            options,
            function,
        });
        trigger_name
    }

    pub fn merge(&mut self, other: &Eventarc) {
        self.resources.extend(other.resources.iter().cloned());
    }

    pub fn trigger_names(&self) -> Vec<&str> {
        self.resources.iter().map(|t| t.trigger_name.as_str()).collect()
    }

    fn service_account(&self, ctx: &DeployContext<'_>) -> GobletResult<String> {
        if let Some(sa) = ctx.config.get_path(&["eventarc", "serviceAccount"]).and_then(|v| v.as_str()) {
            return Ok(sa.to_string());
        }
        ctx.backend()?.service_account().ok_or_else(|| {
            GobletError::validation(
                "Service account not found for cloudrun or eventarc. You can set `serviceAccount` field in config.json under `eventarc`",
            )
        })
    }

    fn trigger_body(&self, ctx: &DeployContext<'_>, trigger: &Trigger, service: &str, service_account: &str) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert(
            "name".into(),
            json!(format!(
                "projects/{}/locations/{}/triggers/{}",
                ctx.project(),
                trigger.region(ctx),
                trigger.trigger_name
            )),
        );
        body.insert("eventFilters".into(), Value::Array(trigger.event_filters()));
        body.insert("serviceAccount".into(), json!(service_account));
        body.insert(
            "destination".into(),
            json!({"cloudRun": {
                "service": service,
                "region": ctx.location(),
                "path": format!("{}{}", TRIGGER_PATH_PREFIX, trigger.trigger_name),
            }}),
        );
        body.insert("labels".into(), Value::Object(ctx.config.labels()));
        body.insert(
            "eventDataContentType".into(),
            json!(trigger.options.content_type.as_deref().unwrap_or("application/json")),
        );
        if let Some(ref topic) = trigger.options.topic {
            body.insert(
                "transport".into(),
                json!({"pubsub": {"topic": format!("projects/{}/topics/{}", ctx.project(), topic)}}),
            );
        }
        body
    }
}

#[async_trait]
impl Resource for Eventarc {
    fn resource_type(&self) -> &'static str {
        "eventarc"
    }

    fn valid_backends(&self) -> &'static [BackendKind] {
        &[BackendKind::CloudRun]
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["eventarc"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("eventarc", "triggers")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn can_sync(&self) -> bool {
        true
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let service_account = self.service_account(ctx)?;
        let service = ctx.backend()?.name().to_string();
        info!(target: "goblet::deployer", "deploying eventarc triggers......");
        for trigger in &self.resources {
            let body = self.trigger_body(ctx, trigger, &service, &service_account);
            create_eventarc_trigger(ctx, &trigger.trigger_name, trigger.region(ctx), body).await?;
        }
        self.service_accounts = vec![service_account];
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for trigger in &self.resources {
            destroy_eventarc_trigger(ctx, &trigger.trigger_name, trigger.region(ctx)).await?;
        }
        Ok(())
    }

    /// Covers triggers in the deploy location only.
    async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        let triggers = ctx.clients.eventarc();
        let call = triggers.call(ctx.api.context(), &Verb::List, None, None, &[]);
        let marker = format!("/triggers/{}-", self.name);
        for trigger in list_all(ctx.api, call, "triggers").await? {
            let Some(full) = trigger.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            if !full.contains(&marker) {
                continue;
            }
            let name = short_name(full);
            if self.resources.iter().any(|t| t.trigger_name == name) {
                continue;
            }
            info!(target: "goblet::deployer", "Detected unused eventarc trigger in GCP {}", full);
            if !dryrun {
                let region = full.split('/').nth(3).unwrap_or_else(|| ctx.location());
                destroy_eventarc_trigger(ctx, name, region).await?;
            }
        }
        Ok(())
    }
}

impl Handler for Eventarc {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let requested = short_name(request.path.trim_end_matches('/'));
        let trigger = self
            .resources
            .iter()
            .find(|t| t.trigger_name == requested)
            .ok_or_else(|| GobletError::NotFound(format!("No trigger found for {}", request.path)))?;
        let response = (trigger.function)(request);
        if response.body.is_null() {
            return Ok(Response::from("success").with_status(response.status));
        }
        Ok(response)
    }

    fn service_accounts(&self, _config: &GConfig) -> Vec<String> {
        self.service_accounts.clone()
    }
}
