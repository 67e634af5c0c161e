//! Cloud Monitoring alert policies over the backend, Pub/Sub dead letters
//! or uptime checks, plus the logging metrics custom conditions rely on.
//!
//! Condition filters are templates. `{monitoring_type}`,
//! `{monitoring_label_key}`, `{resource_name}`, `{app_name}`,
//! `{subscription_id}` and `{check_id}` are filled in at deploy time.

use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, Infrastructure, Resource};
use crate::utils::short_name;
use async_trait::async_trait;
use goblet_gcp::{list_all, Verb, PROJECT_SCHEMA};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

// ── Conditions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Threshold,
    Absence,
    LogMatch,
    Mql,
}

impl ConditionKind {
    pub fn key(&self) -> &'static str {
        match self {
            ConditionKind::Threshold => "conditionThreshold",
            ConditionKind::Absence => "conditionAbsent",
            ConditionKind::LogMatch => "conditionMatchedLog",
            ConditionKind::Mql => "conditionMonitoringQueryLanguage",
        }
    }
}

/// A logging metric created before the condition that watches it.
#[derive(Debug, Clone, PartialEq)]
struct CustomMetric {
    filter: String,
    descriptor: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertCondition {
    pub name: String,
    pub kind: ConditionKind,
    body: Map<String, Value>,
    /// Policy fields this condition needs (log-match rate limits).
    policy_defaults: Map<String, Value>,
    metric: Option<CustomMetric>,
}

const METRIC_FILTER: &str = "resource.type=\"{monitoring_type}\" AND resource.labels.{monitoring_label_key}=\"{resource_name}\" AND metric.type = \"{metric}\"";

fn default_aggregations(period: &str, aligner: &str) -> Value {
    json!([{
        "alignmentPeriod": period,
        "crossSeriesReducer": "REDUCE_NONE",
        "perSeriesAligner": aligner,
    }])
}

/// Replace each `{key}` that has a value; unknown placeholders stay.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{}}}", k), v)
    })
}

impl AlertCondition {
    /// A condition from exactly one of the four condition bodies.
    pub fn from_options(
        name: &str,
        threshold: Option<Map<String, Value>>,
        absence: Option<Map<String, Value>>,
        log_match: Option<Map<String, Value>>,
        mql: Option<Map<String, Value>>,
    ) -> GobletResult<Self> {
        let set: Vec<(ConditionKind, Map<String, Value>)> = [
            (ConditionKind::Threshold, threshold),
            (ConditionKind::Absence, absence),
            (ConditionKind::LogMatch, log_match),
            (ConditionKind::Mql, mql),
        ]
        .into_iter()
        .filter_map(|(kind, body)| body.map(|b| (kind, b)))
        .collect();
        match <[_; 1]>::try_from(set) {
            Ok([(kind, body)]) => Ok(Self::raw(name, kind, body)),
            Err(_) => Err(GobletError::validation("Exactly 1 condition option can be set")),
        }
    }

    pub fn raw(name: &str, kind: ConditionKind, body: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            body,
            policy_defaults: Map::new(),
            metric: None,
        }
    }

    /// Threshold on `metric` for the backend resource.
    pub fn metric(name: &str, metric: &str, value: f64) -> Self {
        let mut body = Map::new();
        body.insert("filter".into(), json!(METRIC_FILTER.replace("{metric}", metric)));
        body.insert("thresholdValue".into(), json!(value));
        body.insert("duration".into(), json!("60s"));
        body.insert("comparison".into(), json!("COMPARISON_GT"));
        body.insert("aggregations".into(), default_aggregations("300s", "ALIGN_MEAN"));
        Self::raw(name, ConditionKind::Threshold, body)
    }

    /// Match log entries of the backend. `replace_filter` drops the
    /// resource prefix.
    pub fn log_match(name: &str, filter: &str, replace_filter: bool) -> Self {
        let filter = if replace_filter {
            filter.to_string()
        } else {
            format!(
                "resource.type=\"{{monitoring_type}}\"\nresource.labels.{{monitoring_label_key}}=\"{{resource_name}}\"\n{}",
                filter
            )
        };
        let mut body = Map::new();
        body.insert("filter".into(), json!(filter));
        let mut condition = Self::raw(name, ConditionKind::LogMatch, body);
        condition.policy_defaults.insert(
            "alertStrategy".into(),
            json!({"notificationRateLimit": {"period": "300s"}, "autoClose": "604800s"}),
        );
        condition
    }

    /// Threshold on logging metric `{app}-{name}`, created from
    /// `metric_filter` on deploy.
    pub fn custom_metric(name: &str, metric_filter: &str, value: f64) -> Self {
        let mut condition = Self::metric(name, &format!("logging.googleapis.com/user/{{app_name}}-{}", name), value);
        condition.metric = Some(CustomMetric {
            filter: format!(
                "resource.type=\"{{monitoring_type}}\" resource.labels.{{monitoring_label_key}}=\"{{resource_name}}\" {}",
                metric_filter
            ),
            descriptor: Map::new(),
        });
        condition
    }

    /// Dead-lettered messages on a subscription.
    pub fn pubsub_dlq(name: &str, value: f64) -> Self {
        Self::metric(name, "pubsub.googleapis.com/subscription/dead_letter_message_count", value).with_field(
            "filter",
            json!("resource.labels.subscription_id = \"{subscription_id}\" AND resource.type = \"pubsub_subscription\" AND metric.type = \"pubsub.googleapis.com/subscription/dead_letter_message_count\""),
        )
    }

    /// Failing uptime check.
    pub fn uptime(name: &str, value: f64) -> Self {
        Self::metric(name, "monitoring.googleapis.com/uptime_check/check_passed", value)
            .with_field(
                "filter",
                json!("resource.type = \"uptime_url\" AND metric.labels.check_id = \"{check_id}\" AND metric.type = \"monitoring.googleapis.com/uptime_check/check_passed\""),
            )
            .with_field("aggregations", default_aggregations("1200s", "ALIGN_FRACTION_TRUE"))
            .with_field("comparison", json!("COMPARISON_LT"))
    }

    /// Override one field of the condition body.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    /// Overlay for the custom metric's `metricDescriptor`.
    pub fn with_metric_descriptor(mut self, descriptor: Map<String, Value>) -> Self {
        if let Some(ref mut metric) = self.metric {
            metric.descriptor = descriptor;
        }
        self
    }

    /// The condition with its filter or query rendered.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Value {
        let mut body = self.body.clone();
        for key in ["filter", "query"] {
            if let Some(Value::String(t)) = body.get(key) {
                let rendered = render_template(t, vars);
                body.insert(key.into(), Value::String(rendered));
            }
        }
        let mut condition = Map::new();
        condition.insert("displayName".into(), json!(self.name));
        condition.insert(self.kind.key().into(), Value::Object(body));
        Value::Object(condition)
    }

    fn metric_name(&self, app: &str) -> String {
        format!("{}-{}", app, self.name)
    }

    fn metric_body(&self, ctx: &DeployContext<'_>, vars: &BTreeMap<&str, String>) -> Option<Value> {
        let metric = self.metric.as_ref()?;
        let name = self.metric_name(ctx.app_name);
        let metric_type = format!("logging.googleapis.com/user/{}", name);
        let mut descriptor = Map::new();
        descriptor.insert(
            "name".into(),
            json!(format!("projects/{}/metricDescriptors/{}", ctx.project(), metric_type)),
        );
        descriptor.insert("metricKind".into(), json!("DELTA"));
        descriptor.insert("valueType".into(), json!("INT64"));
        descriptor.insert("unit".into(), json!("1"));
        descriptor.insert("type".into(), json!(metric_type));
        for (k, v) in &metric.descriptor {
            descriptor.insert(k.clone(), v.clone());
        }
        Some(json!({
            "name": name,
            "description": format!("Goblet generated custom metric for metric {}", name),
            "filter": render_template(&metric.filter, vars),
            "metricDescriptor": descriptor,
        }))
    }

    /// Create or update the logging metric, if this condition has one.
    async fn deploy_metric(&self, ctx: &DeployContext<'_>, vars: &BTreeMap<&str, String>) -> GobletResult<()> {
        let Some(body) = self.metric_body(ctx, vars) else {
            return Ok(());
        };
        let name = self.metric_name(ctx.app_name);
        let metrics = ctx.clients.logging_metric();
        match metrics
            .execute(ctx.api, Verb::Create, None, Some(body.clone()), &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => {
                info!(target: "goblet::deployer", "deploying custom metric {}", name);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "updating custom metric {}", name);
                let path = format!("{}/metrics/{}", PROJECT_SCHEMA, name);
                metrics.execute(ctx.api, Verb::Update, Some(&path), Some(body), &[]).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy_metric(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        if self.metric.is_none() {
            return Ok(());
        }
        let name = self.metric_name(ctx.app_name);
        let path = format!("{}/metrics/{}", PROJECT_SCHEMA, name);
        match ctx
            .clients
            .logging_metric()
            .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => info!(target: "goblet::deployer", "deleting custom metric {}", name),
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "Custom metric {} already destroyed", name)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

// ── Alert Policies ──────────────────────────────────────────────────────

/// What an alert watches; decides which template values exist.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTarget {
    Backend,
    /// Subscription id, e.g. `{app}-{topic}`.
    PubSubSubscription(String),
    /// Uptime check display name.
    Uptime(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub target: AlertTarget,
    pub conditions: Vec<AlertCondition>,
    pub notification_channels: Vec<String>,
    /// Extra policy fields (documentation, severity, ...).
    pub extra: Map<String, Value>,
}

impl Alert {
    pub fn new(target: AlertTarget, conditions: Vec<AlertCondition>) -> Self {
        Self {
            target,
            conditions,
            notification_channels: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        self.notification_channels = channels.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

pub struct Alerts {
    name: String,
    resources: BTreeMap<String, Alert>,
}

impl Alerts {
    pub fn new(app_name: &str) -> Self {
        Self {
            name: app_name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// Register policy `{app}-{name}`.
    pub fn register(&mut self, name: &str, alert: Alert) -> GobletResult<String> {
        if alert.conditions.is_empty() {
            return Err(GobletError::validation(format!("alert {} has no conditions", name)));
        }
        let policy = format!("{}-{}", self.name, name);
        self.resources.insert(policy.clone(), alert);
        Ok(policy)
    }

    pub fn merge(&mut self, other: &Alerts) {
        self.resources.extend(other.resources.clone());
    }

    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Deployed policies of this app: display name → resource name.
    async fn deployed_alerts(&self, ctx: &DeployContext<'_>) -> GobletResult<BTreeMap<String, String>> {
        let filter = format!("display_name=starts_with(\"{}-\")", self.name);
        let call = ctx
            .clients
            .monitoring_alert()
            .call(ctx.api.context(), &Verb::List, None, None, &[("filter", filter.as_str())]);
        Ok(list_all(ctx.api, call, "alertPolicies")
            .await?
            .into_iter()
            .filter_map(|a| {
                let display = a.get("displayName")?.as_str()?.to_string();
                let name = a.get("name")?.as_str()?.to_string();
                Some((display, name))
            })
            .collect())
    }

    async fn uptime_check_ids(&self, ctx: &DeployContext<'_>) -> GobletResult<BTreeMap<String, String>> {
        if !self.resources.values().any(|a| matches!(a.target, AlertTarget::Uptime(_))) {
            return Ok(BTreeMap::new());
        }
        let call = ctx.clients.monitoring_uptime().call(ctx.api.context(), &Verb::List, None, None, &[]);
        Ok(list_all(ctx.api, call, "uptimeCheckConfigs")
            .await?
            .into_iter()
            .filter_map(|c| {
                let display = c.get("displayName")?.as_str()?.to_string();
                let id = short_name(c.get("name")?.as_str()?).to_string();
                Some((display, id))
            })
            .collect())
    }

    fn template_vars(
        &self,
        ctx: &DeployContext<'_>,
        target: &AlertTarget,
        checks: &BTreeMap<String, String>,
    ) -> BTreeMap<&'static str, String> {
        let resource_name = ctx
            .backend()
            .map(|b| b.name().to_string())
            .unwrap_or_else(|_| self.name.clone());
        let mut vars = BTreeMap::new();
        vars.insert("app_name", self.name.clone());
        vars.insert("monitoring_type", ctx.backend_kind.monitoring_type().to_string());
        vars.insert("monitoring_label_key", ctx.backend_kind.monitoring_label_key().to_string());
        vars.insert("resource_name", resource_name);
        match target {
            AlertTarget::Backend => {}
            AlertTarget::PubSubSubscription(sub) => {
                vars.insert("subscription_id", sub.clone());
            }
            AlertTarget::Uptime(check) => {
                let id = checks.get(check).cloned().unwrap_or_else(|| check.clone());
                vars.insert("check_id", id);
            }
        }
        vars
    }

    /// The policy body for `policy` with every condition rendered.
    pub fn policy_body(
        &self,
        ctx: &DeployContext<'_>,
        policy: &str,
        alert: &Alert,
        checks: &BTreeMap<String, String>,
    ) -> Value {
        let vars = self.template_vars(ctx, &alert.target, checks);
        let channels = match ctx.config.get_path(&["alerts", "notification_channels"]) {
            Some(Value::Array(list)) => Value::Array(list.clone()),
            _ => json!(alert.notification_channels),
        };
        let mut body = Map::new();
        body.insert("displayName".into(), json!(policy));
        body.insert(
            "conditions".into(),
            Value::Array(alert.conditions.iter().map(|c| c.render(&vars)).collect()),
        );
        body.insert("notificationChannels".into(), channels);
        body.insert("combiner".into(), json!("OR"));
        for condition in &alert.conditions {
            for (k, v) in &condition.policy_defaults {
                body.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &alert.extra {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }

    async fn delete_policy(&self, ctx: &DeployContext<'_>, display: &str, name: &str) -> GobletResult<()> {
        match ctx
            .clients
            .monitoring_alert()
            .execute(ctx.api, Verb::Delete, Some(name), None, &[])
            .await
            .map_err(GobletError::from)
        {
            Ok(_) => info!(target: "goblet::deployer", "Destroying alert {}......", display),
            Err(e) if e.is_not_found() => info!(target: "goblet::deployer", "Alert {} already destroyed", display),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for Alerts {
    fn resource_type(&self) -> &'static str {
        "alerts"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["monitoring", "logging"]
    }

    fn permissions(&self) -> Vec<String> {
        let mut perms = gcp_generic_resource_permissions("monitoring", "alertPolicies");
        perms.extend(gcp_generic_resource_permissions("logging", "logMetrics"));
        perms
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn can_sync(&self) -> bool {
        true
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        info!(target: "goblet::deployer", "deploying alerts......");
        let deployed = self.deployed_alerts(ctx).await?;
        let checks = self.uptime_check_ids(ctx).await?;
        let policies = ctx.clients.monitoring_alert();
        for (policy, alert) in &self.resources {
            let vars = self.template_vars(ctx, &alert.target, &checks);
            for condition in &alert.conditions {
                condition.deploy_metric(ctx, &vars).await?;
            }
            let body = self.policy_body(ctx, policy, alert, &checks);
            match deployed.get(policy) {
                Some(existing) => {
                    let mask = body
                        .as_object()
                        .map(|b| b.keys().cloned().collect::<Vec<_>>().join(","))
                        .unwrap_or_default();
                    policies
                        .execute(ctx.api, Verb::Patch, Some(existing), Some(body), &[("updateMask", mask.as_str())])
                        .await?;
                    info!(target: "goblet::deployer", "updated alert: {}", policy);
                }
                None => {
                    policies.execute(ctx.api, Verb::Create, None, Some(body), &[]).await?;
                    info!(target: "goblet::deployer", "created alert: {}", policy);
                }
            }
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let deployed = self.deployed_alerts(ctx).await?;
        for (policy, alert) in &self.resources {
            match deployed.get(policy) {
                Some(name) => self.delete_policy(ctx, policy, name).await?,
                None => info!(target: "goblet::deployer", "Alert {} already destroyed", policy),
            }
            for condition in &alert.conditions {
                condition.destroy_metric(ctx).await?;
            }
        }
        Ok(())
    }

    /// Custom metrics are left in place.
    async fn sync(&self, ctx: &DeployContext<'_>, dryrun: bool) -> GobletResult<()> {
        for (display, name) in self.deployed_alerts(ctx).await? {
            if self.resources.contains_key(&display) {
                continue;
            }
            info!(target: "goblet::deployer", "Detected unused alert {}", display);
            if !dryrun {
                self.delete_policy(ctx, &display, &name).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for Alerts {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::config::GConfig;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};

    fn threshold() -> Map<String, Value> {
        json!({"filter": "x", "thresholdValue": 1}).as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_exactly_one_condition_body() {
        assert!(AlertCondition::from_options("c", Some(threshold()), None, None, None).is_ok());
        assert!(AlertCondition::from_options("c", None, None, None, None).is_err());
        assert!(AlertCondition::from_options("c", Some(threshold()), None, Some(threshold()), None).is_err());
        let mql = AlertCondition::from_options("c", None, None, None, Some(threshold())).unwrap();
        assert_eq!(mql.kind.key(), "conditionMonitoringQueryLanguage");
    }

    #[test]
    fn test_filters_are_rendered_per_backend() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudFunction);
        let mut alerts = Alerts::new("app");
        alerts
            .register(
                "errors",
                Alert::new(
                    AlertTarget::Backend,
                    vec![AlertCondition::log_match("error", "severity>=ERROR", false)],
                ),
            )
            .unwrap();
        let alert = alerts.resources["app-errors"].clone();
        let body = alerts.policy_body(&ctx, "app-errors", &alert, &BTreeMap::new());
        let filter = body["conditions"][0]["conditionMatchedLog"]["filter"].as_str().unwrap();
        assert_eq!(
            filter,
            "resource.type=\"cloud_function\"\nresource.labels.function_name=\"app\"\nseverity>=ERROR"
        );
        assert_eq!(body["alertStrategy"]["autoClose"], "604800s");
        assert_eq!(body["combiner"], "OR");
    }

    #[test]
    fn test_dlq_and_uptime_templates() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"alerts": {"notification_channels": ["projects/proj/notificationChannels/1"]}}));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let alerts = Alerts::new("app");
        let dlq = Alert::new(
            AlertTarget::PubSubSubscription("app-events".into()),
            vec![AlertCondition::pubsub_dlq("dlq", 0.0)],
        );
        let body = alerts.policy_body(&ctx, "app-dlq", &dlq, &BTreeMap::new());
        assert!(body["conditions"][0]["conditionThreshold"]["filter"]
            .as_str()
            .unwrap()
            .contains("subscription_id = \"app-events\""));
        assert_eq!(body["notificationChannels"][0], "projects/proj/notificationChannels/1");

        let mut checks = BTreeMap::new();
        checks.insert("app-health".to_string(), "app-health-abc".to_string());
        let up = Alert::new(AlertTarget::Uptime("app-health".into()), vec![AlertCondition::uptime("up", 0.5)]);
        let body = alerts.policy_body(&ctx, "app-up", &up, &checks);
        let cond = &body["conditions"][0]["conditionThreshold"];
        assert!(cond["filter"].as_str().unwrap().contains("check_id = \"app-health-abc\""));
        assert_eq!(cond["comparison"], "COMPARISON_LT");
        assert_eq!(cond["aggregations"][0]["perSeriesAligner"], "ALIGN_FRACTION_TRUE");
    }

    #[tokio::test]
    async fn test_custom_metric_then_patch_existing_policy() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "alertPolicies",
            json!({"alertPolicies": [
                {"name": "projects/proj/alertPolicies/1", "displayName": "app-slow"},
                {"name": "projects/proj/alertPolicies/2", "displayName": "app-stale"}
            ]}),
        );
        cloud.fail(HttpMethod::Post, "metrics", 409);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut alerts = Alerts::new("app");
        alerts
            .register(
                "slow",
                Alert::new(
                    AlertTarget::Backend,
                    vec![AlertCondition::custom_metric("slow", "textPayload:\"slow\"", 10.0)],
                ),
            )
            .unwrap();
        alerts.deploy(&ctx).await.unwrap();

        let update = cloud.calls_to(HttpMethod::Put, "v2/projects/proj/metrics/app-slow");
        assert_eq!(update.len(), 1);
        assert!(update[0].body.as_ref().unwrap()["filter"]
            .as_str()
            .unwrap()
            .starts_with("resource.type=\"cloud_run_revision\" resource.labels.service_name=\"app\""));
        let patch = cloud.calls_to(HttpMethod::Patch, "alertPolicies/1");
        assert_eq!(patch.len(), 1);
        assert!(patch[0].body.as_ref().unwrap()["conditions"][0]["conditionThreshold"]["filter"]
            .as_str()
            .unwrap()
            .contains("logging.googleapis.com/user/app-slow"));

        alerts.sync(&ctx, true).await.unwrap();
        assert_eq!(cloud.count(HttpMethod::Delete, "alertPolicies"), 0);
        alerts.sync(&ctx, false).await.unwrap();
        assert_eq!(cloud.count(HttpMethod::Delete, "alertPolicies/2"), 1);
        assert_eq!(cloud.count(HttpMethod::Delete, "alertPolicies/1"), 0);
    }
}
