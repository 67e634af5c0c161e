//! Cloud Monitoring uptime checks probing the backend.

use super::NoArgFn;
use crate::backends::BackendKind;
use crate::config::deep_merge;
use crate::dispatch::HEADER_UPTIME_NAME;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::request::{EventContext, Request, Response};
use crate::resource::{DeployContext, Handler, Resource};
use crate::utils::update_mask;
use async_trait::async_trait;
use goblet_gcp::{list_all, Verb};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Clone)]
struct UptimeCheck {
    function: NoArgFn,
    config: Map<String, Value>,
}

pub struct Uptime {
    name: String,
    resources: BTreeMap<String, UptimeCheck>,
}

impl Uptime {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// `config` is deep-merged over the generated check.
    pub fn register(&mut self, name: &str, function: NoArgFn, config: Map<String, Value>) {
        self.resources.insert(name.to_string(), UptimeCheck { function, config });
    }

    pub fn merge(&mut self, other: &Uptime) {
        self.resources.extend(other.resources.clone());
    }

    fn display_name(&self, name: &str) -> String {
        format!("{}-{}", self.name, name)
    }

    /// The check body for `name` on the given backend.
    pub fn check_config(&self, ctx: &DeployContext<'_>, name: &str) -> Value {
        let (resource, path) = match ctx.backend_kind {
            BackendKind::CloudRun => (
                json!({
                    "type": "cloud_run_revision",
                    "labels": {
                        "location": ctx.location(),
                        "service_name": self.name,
                        "project_id": ctx.project(),
                    },
                }),
                "/".to_string(),
            ),
            _ => (
                json!({
                    "type": "cloud_function",
                    "labels": {
                        "function_name": self.name,
                        "region": ctx.location(),
                        "project_id": ctx.project(),
                    },
                }),
                format!("/{}", self.name),
            ),
        };
        let mut check = json!({
            "displayName": self.display_name(name),
            "monitoredResource": resource,
            "httpCheck": {
                "useSsl": true,
                "path": path,
                "headers": { HEADER_UPTIME_NAME: name },
            },
            "period": "60s",
            "timeout": "10s",
        });
        if let Some(registered) = self.resources.get(name) {
            deep_merge(&mut check, &Value::Object(registered.config.clone()));
        }
        check
    }

    async fn deployed_checks(&self, ctx: &DeployContext<'_>) -> GobletResult<BTreeMap<String, String>> {
        let checks = ctx.clients.monitoring_uptime();
        let call = checks.call(ctx.api.context(), &Verb::List, None, None, &[]);
        Ok(list_all(ctx.api, call, "uptimeCheckConfigs")
            .await?
            .into_iter()
            .filter_map(|c| {
                let display = c.get("displayName")?.as_str()?.to_string();
                let name = c.get("name")?.as_str()?.to_string();
                Some((display, name))
            })
            .collect())
    }
}

#[async_trait]
impl Resource for Uptime {
    fn resource_type(&self) -> &'static str {
        "uptime"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["monitoring"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("monitoring", "uptimeCheckConfigs")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        info!(target: "goblet::deployer", "deploying uptime checks......");
        let deployed = self.deployed_checks(ctx).await?;
        let checks = ctx.clients.monitoring_uptime();
        for name in self.resources.keys() {
            let body = self.check_config(ctx, name);
            let display = self.display_name(name);
            match deployed.get(&display) {
                Some(existing) => {
                    let mask = body
                        .as_object()
                        .map(|b| update_mask(b, &["monitoredResource", "name"]))
                        .unwrap_or_default();
                    checks
                        .execute(ctx.api, Verb::Patch, Some(existing), Some(body), &[("updateMask", mask.as_str())])
                        .await?;
                    info!(target: "goblet::deployer", "updated uptime check {}", display);
                }
                None => {
                    checks.execute(ctx.api, Verb::Create, None, Some(body), &[]).await?;
                    info!(target: "goblet::deployer", "created uptime check {}", display);
                }
            }
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let deployed = self.deployed_checks(ctx).await?;
        let checks = ctx.clients.monitoring_uptime();
        for name in self.resources.keys() {
            let display = self.display_name(name);
            let Some(existing) = deployed.get(&display) else {
                info!(target: "goblet::deployer", "uptime check {} already destroyed", display);
                continue;
            };
            match checks
                .execute(ctx.api, Verb::Delete, Some(existing), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(target: "goblet::deployer", "deleting uptime check {}......", display),
                Err(e) if e.is_not_found() => {
                    info!(target: "goblet::deployer", "uptime check {} already destroyed", display)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Handler for Uptime {
    fn dispatch(&self, request: &Request, _context: Option<&EventContext>) -> GobletResult<Response> {
        let name = request
            .header(HEADER_UPTIME_NAME)
            .ok_or_else(|| GobletError::validation("No X-Goblet-Uptime-Name header found"))?;
        let check = self
            .resources
            .get(name)
            .ok_or_else(|| GobletError::NotFound(format!("uptime check {} not found", name)))?;
        Ok((check.function)())
    }
}
