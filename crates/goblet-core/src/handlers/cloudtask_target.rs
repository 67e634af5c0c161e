//! HTTP targets for Cloud Tasks created by a `CloudTaskClient`.

use super::RequestFn;
use crate::config::GConfig;
use crate::dispatch::HEADER_CLOUDTASK_TARGET;
use crate::error::{GobletError, GobletResult};
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Clone, Default)]
pub struct CloudTaskTarget {
    resources: BTreeMap<String, RequestFn>,
}

impl CloudTaskTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, function: RequestFn) -> GobletResult<()> {
        if self.resources.contains_key(name) {
            return Err(GobletError::validation(format!("cloudtasktarget {} already registered", name)));
        }
        self.resources.insert(name.to_string(), function);
        Ok(())
    }

    pub fn merge(&mut self, other: &CloudTaskTarget) -> GobletResult<()> {
        for (name, function) in &other.resources {
            self.register(name, function.clone())?;
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for CloudTaskTarget {
    fn resource_type(&self) -> &'static str {
        "cloudtask_http_target"
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
        Ok(())
    }

    async fn destroy(&self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
        Ok(())
    }
}

impl Handler for CloudTaskTarget {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let target = request
            .header(HEADER_CLOUDTASK_TARGET)
            .ok_or_else(|| GobletError::validation("No X-Goblet-CloudTask-Target header found"))?;
        let function = self
            .resources
            .get(target)
            .ok_or_else(|| GobletError::NotFound(format!("cloudtasktarget {} not found", target)))?;
        Ok(function(request))
    }

    /// The queue's OIDC identity must be able to invoke the backend.
    fn service_accounts(&self, config: &GConfig) -> Vec<String> {
        match config.get_path(&["cloudtask", "serviceAccount"]) {
            Some(serde_json::Value::String(sa)) => vec![sa.clone()],
            Some(serde_json::Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}
