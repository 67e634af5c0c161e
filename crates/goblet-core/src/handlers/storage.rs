//! Cloud Storage object events, delivered to background Cloud Functions.

use super::StorageFn;
use crate::backends::{BackendKind, EventFunction};
use crate::cloud_actions::destroy_cloudfunction;
use crate::error::{GobletError, GobletResult};
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

pub const V1_EVENT_TYPES: &[&str] = &["finalize", "delete", "archive", "metadataUpdate"];
pub const V2_EVENT_TYPES: &[&str] = &["finalized", "deleted", "archived", "metadataUpdated"];

/// Map either vocabulary onto the v1 name.
pub fn canonical_event(event: &str) -> Option<&'static str> {
    V1_EVENT_TYPES
        .iter()
        .zip(V2_EVENT_TYPES)
        .find(|(v1, v2)| event == **v1 || event == **v2)
        .map(|(v1, _)| *v1)
}

#[derive(Clone)]
struct BucketTrigger {
    bucket: String,
    event_type: String,
    name: String,
    function: StorageFn,
}

impl BucketTrigger {
    fn function_name(&self, app: &str) -> String {
        format!("{}-storage-{}-{}", app, self.name, self.event_type).replace('.', "-")
    }
}

pub struct Storage {
    name: String,
    backend_kind: BackendKind,
    resources: Vec<BucketTrigger>,
}

impl Storage {
    pub fn new(app_name: &str, backend_kind: BackendKind) -> Self {
        Self {
            name: app_name.to_string(),
            backend_kind,
            resources: Vec::new(),
        }
    }

    fn valid_event_types(&self) -> &'static [&'static str] {
        match self.backend_kind {
            BackendKind::CloudFunction => V1_EVENT_TYPES,
            _ => V2_EVENT_TYPES,
        }
    }

    pub fn register(&mut self, name: &str, bucket: &str, event_type: &str, function: StorageFn) -> GobletResult<()> {
        let valid = self.valid_event_types();
        if !valid.contains(&event_type) {
            return Err(GobletError::validation(format!(
                "{} not in {:?}. See https://cloud.google.com/functions/docs/calling/storage for more information.",
                event_type, valid
            )));
        }
        self.resources.push(BucketTrigger {
            bucket: bucket.to_string(),
            event_type: event_type.to_string(),
            name: name.to_string(),
            function,
        });
        Ok(())
    }

    pub fn merge(&mut self, other: &Storage) {
        self.resources.extend(other.resources.iter().cloned());
    }

    fn event_trigger(&self, ctx: &DeployContext<'_>, trigger: &BucketTrigger) -> Value {
        match ctx.backend_kind {
            BackendKind::CloudFunction => json!({
                "eventType": format!("google.storage.object.{}", trigger.event_type),
                "resource": format!("projects/{}/buckets/{}", ctx.project(), trigger.bucket),
            }),
            _ => json!({
                "eventType": format!("google.cloud.storage.object.v1.{}", trigger.event_type),
                "eventFilters": [{"attribute": "bucket", "value": trigger.bucket}],
            }),
        }
    }
}

#[async_trait]
impl Resource for Storage {
    fn resource_type(&self) -> &'static str {
        "storage"
    }

    fn valid_backends(&self) -> &'static [BackendKind] {
        BackendKind::FUNCTIONS
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudfunctions"]
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        info!(target: "goblet::deployer", "deploying storage functions......");
        let backend = ctx.backend()?;
        for trigger in &self.resources {
            let function = EventFunction {
                name: trigger.function_name(&self.name),
                trigger: self.event_trigger(ctx, trigger),
            };
            backend.deploy_event_function(ctx, &function).await?;
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        for trigger in &self.resources {
            destroy_cloudfunction(ctx, &trigger.function_name(&self.name)).await?;
        }
        Ok(())
    }
}

impl Handler for Storage {
    fn dispatch(&self, request: &Request, context: Option<&EventContext>) -> GobletResult<Response> {
        let event_type = context
            .map(|c| c.event_type.rsplit('.').next().unwrap_or_default())
            .unwrap_or_default();
        let kind = canonical_event(event_type);
        let event = request.body.clone().unwrap_or(Value::Null);
        let bucket = event.get("bucket").and_then(|v| v.as_str()).unwrap_or_default();

        let mut results: Vec<Value> = self
            .resources
            .iter()
            .filter(|t| t.bucket == bucket && kind.is_some() && canonical_event(&t.event_type) == kind)
            .map(|t| (t.function)(&event))
            .collect();
        match results.len() {
            0 => Err(GobletError::NotFound("No functions found".into())),
            1 => Ok(Response::from(results.remove(0))),
            _ => Ok(Response::from(Value::Array(results))),
        }
    }
}
