//! Cloud Tasks queues and the client that enqueues HTTP tasks onto them.

use crate::dispatch::HEADER_CLOUDTASK_TARGET;
use crate::error::{GobletError, GobletResult};
use crate::permissions::gcp_generic_resource_permissions;
use crate::resource::{DeployContext, InfraConfig, Infrastructure, Resource};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use goblet_gcp::{CloudApi, Verb, VersionedClients, LOCATION_SCHEMA};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn queue_schema(id: &str) -> String {
    format!("{}/queues/{}", LOCATION_SCHEMA, id)
}

// ── Task Client ─────────────────────────────────────────────────────────

/// Optional parts of an enqueued task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    pub in_seconds: Option<i64>,
    pub task_name: Option<String>,
    /// Dispatch deadline in seconds.
    pub deadline: Option<u64>,
}

/// Enqueues HTTP tasks for a `cloudtask_target` handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudTaskClient {
    /// `projects/{project_id}/locations/{location_id}/queues/{id}`.
    pub queue: String,
    pub service_account: Option<String>,
}

impl CloudTaskClient {
    /// The task body as of `now`. Object and array payloads are sent as
    /// JSON; strings as-is.
    pub fn build_task_at(
        &self,
        queue: &str,
        endpoint: &str,
        target: &str,
        payload: Option<&Value>,
        options: &TaskOptions,
        now: DateTime<Utc>,
    ) -> Value {
        let mut headers = Map::new();
        headers.insert(HEADER_CLOUDTASK_TARGET.into(), json!(target));
        let mut request = Map::new();
        request.insert("httpMethod".into(), json!("POST"));
        request.insert("url".into(), json!(endpoint));
        request.insert(
            "oidcToken".into(),
            json!({"serviceAccountEmail": self.service_account, "audience": endpoint}),
        );
        match payload {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => {
                request.insert("body".into(), json!(STANDARD.encode(raw)));
            }
            Some(other) => {
                headers.insert("Content-Type".into(), json!("application/json"));
                request.insert("body".into(), json!(STANDARD.encode(other.to_string())));
            }
        }
        request.insert("headers".into(), Value::Object(headers));

        let mut task = Map::new();
        task.insert("httpRequest".into(), Value::Object(request));
        if let Some(secs) = options.in_seconds {
            let at = now + Duration::seconds(secs);
            task.insert("scheduleTime".into(), json!(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        if let Some(ref name) = options.task_name {
            task.insert("name".into(), json!(format!("{}/tasks/{}", queue, name)));
        }
        if let Some(deadline) = options.deadline {
            task.insert("dispatchDeadline".into(), json!(format!("{}s", deadline)));
        }
        Value::Object(task)
    }

    /// Create the task on the queue; `endpoint` is the backend URL.
    pub async fn enqueue(
        &self,
        api: &dyn CloudApi,
        clients: &VersionedClients,
        endpoint: &str,
        target: &str,
        payload: Option<&Value>,
        options: &TaskOptions,
    ) -> GobletResult<Value> {
        let queue = api.context().render(&self.queue);
        let task = self.build_task_at(&queue, endpoint, target, payload, options, Utc::now());
        Ok(clients
            .cloudtask()
            .execute(api, Verb::Create, Some(&self.queue), Some(json!({ "task": task })), &[])
            .await?)
    }
}

// ── Queues ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CloudTaskQueue {
    resources: BTreeMap<String, Option<Map<String, Value>>>,
}

impl CloudTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register queue `id`. Without `config` the `cloudtaskqueue.{id}`
    /// config section applies at deploy time.
    pub fn register(
        &mut self,
        id: &str,
        config: Option<Map<String, Value>>,
        service_account: Option<String>,
    ) -> CloudTaskClient {
        self.resources.insert(id.to_string(), config);
        CloudTaskClient {
            queue: queue_schema(id),
            service_account,
        }
    }

    pub fn merge(&mut self, other: &CloudTaskQueue) {
        self.resources.extend(other.resources.clone());
    }

    fn queue_config(&self, ctx: &DeployContext<'_>, id: &str) -> Map<String, Value> {
        match self.resources.get(id) {
            Some(Some(config)) => config.clone(),
            _ => ctx
                .config
                .get_path(&["cloudtaskqueue", id])
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Sections whose user-set keys differ from the deployed queue. Keys
    /// the user did not set are never compared.
    pub fn changed_sections(desired: &Map<String, Value>, deployed: &Value) -> Vec<String> {
        desired
            .iter()
            .filter(|(section, _)| matches!(section.as_str(), "rateLimits" | "retryConfig"))
            .filter(|(section, values)| {
                values.as_object().into_iter().flatten().any(|(k, v)| {
                    match deployed.get(section.as_str()).and_then(|s| s.get(k)) {
                        Some(live) => live != v,
                        None => {
                            info!(target: "goblet::deployer", "config {}.{} not found in deployed config", section, k);
                            false
                        }
                    }
                })
            })
            .map(|(section, _)| section.clone())
            .collect()
    }
}

#[async_trait]
impl Resource for CloudTaskQueue {
    fn resource_type(&self) -> &'static str {
        "cloudtaskqueue"
    }

    fn required_apis(&self) -> Vec<&'static str> {
        vec!["cloudtasks"]
    }

    fn permissions(&self) -> Vec<String> {
        gcp_generic_resource_permissions("cloudtasks", "queues")
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let queues = ctx.clients.cloudtask_queue();
        for id in self.resources.keys() {
            let config = self.queue_config(ctx, id);
            let path = queue_schema(id);
            let mut body = config.clone();
            body.insert("name".into(), json!(ctx.render(&path)));
            match queues
                .execute(ctx.api, Verb::Create, None, Some(Value::Object(body.clone())), &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(target: "goblet::deployer", "CloudTask Queue [{}] deployed", id),
                Err(e) if e.is_already_exists() => {
                    info!(target: "goblet::deployer", "found cloudtask queue {}", id);
                    if config.is_empty() {
                        continue;
                    }
                    let deployed = queues.execute(ctx.api, Verb::Get, Some(&path), None, &[]).await?;
                    let changed = Self::changed_sections(&config, &deployed);
                    if changed.is_empty() {
                        continue;
                    }
                    let mask = changed.join(",");
                    queues
                        .execute(
                            ctx.api,
                            Verb::Patch,
                            Some(&path),
                            Some(Value::Object(body)),
                            &[("updateMask", mask.as_str())],
                        )
                        .await?;
                    info!(target: "goblet::deployer", "CloudTask Queue [{}] patched", id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()> {
        let queues = ctx.clients.cloudtask_queue();
        for id in self.resources.keys() {
            match queues
                .execute(ctx.api, Verb::Delete, Some(&queue_schema(id)), None, &[])
                .await
                .map_err(GobletError::from)
            {
                Ok(_) => info!(target: "goblet::deployer", "CloudTask Queue [{}] destroyed", id),
                Err(e) if e.is_not_found() => {
                    info!(target: "goblet::deployer", "cloudtask queue {} already destroyed", id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Infrastructure for CloudTaskQueue {
    /// `CLOUDTASK_QUEUE_{ID}` → full queue name, one per queue.
    async fn get_config(&self, ctx: &DeployContext<'_>) -> GobletResult<Option<InfraConfig>> {
        if self.resources.is_empty() {
            return Ok(None);
        }
        let values = self
            .resources
            .keys()
            .map(|id| {
                let key = format!("CLOUDTASK_QUEUE_{}", id.to_uppercase().replace('-', "_"));
                (key, json!(ctx.render(&queue_schema(id))))
            })
            .collect();
        Ok(Some(InfraConfig::new("cloudtaskqueue", values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::config::GConfig;
    use chrono::TimeZone;
    use goblet_gcp::{FakeCloud, HttpMethod};

    fn client() -> CloudTaskClient {
        CloudTaskClient {
            queue: queue_schema("work"),
            service_account: Some("tasks@p.iam.gserviceaccount.com".into()),
        }
    }

    #[test]
    fn test_build_task() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let options = TaskOptions {
            in_seconds: Some(90),
            task_name: Some("t1".into()),
            deadline: Some(300),
        };
        let task = client().build_task_at(
            "projects/p/locations/l/queues/work",
            "https://app.run.app",
            "target",
            Some(&json!({"id": 1})),
            &options,
            now,
        );
        let req = &task["httpRequest"];
        assert_eq!(req["headers"]["X-Goblet-CloudTask-Target"], "target");
        assert_eq!(req["headers"]["Content-Type"], "application/json");
        assert_eq!(req["oidcToken"]["audience"], "https://app.run.app");
        assert_eq!(STANDARD.decode(req["body"].as_str().unwrap()).unwrap(), br#"{"id":1}"#.to_vec());
        assert_eq!(task["scheduleTime"], "2024-01-01T00:01:30Z");
        assert_eq!(task["name"], "projects/p/locations/l/queues/work/tasks/t1");
        assert_eq!(task["dispatchDeadline"], "300s");

        let plain = client().build_task_at("q", "u", "target", Some(&json!("hi")), &TaskOptions::default(), now);
        assert!(plain["httpRequest"]["headers"].get("Content-Type").is_none());
        assert!(plain.get("scheduleTime").is_none());
    }

    #[test]
    fn test_only_user_keys_are_compared() {
        let desired = json!({"rateLimits": {"maxDispatchesPerSecond": 10}});
        let deployed = json!({"rateLimits": {"maxDispatchesPerSecond": 10, "maxConcurrentDispatches": 1000}});
        assert!(CloudTaskQueue::changed_sections(desired.as_object().unwrap(), &deployed).is_empty());
        let deployed = json!({"rateLimits": {"maxDispatchesPerSecond": 500}});
        assert_eq!(
            CloudTaskQueue::changed_sections(desired.as_object().unwrap(), &deployed),
            vec!["rateLimits".to_string()]
        );
    }

    #[tokio::test]
    async fn test_existing_queue_patched_when_changed() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Post, "queues", 409);
        cloud.on(
            HttpMethod::Get,
            "queues/work",
            json!({"rateLimits": {"maxDispatchesPerSecond": 500}, "retryConfig": {"maxAttempts": 100}}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::new(json!({"cloudtaskqueue": {"work": {"rateLimits": {"maxDispatchesPerSecond": 10}}}}));
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let mut queues = CloudTaskQueue::new();
        queues.register("work", None, None);
        queues.register("idle", None, None);
        queues.deploy(&ctx).await.unwrap();

        let patch = cloud.calls_to(HttpMethod::Patch, "queues/work");
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[0].query_value("updateMask"), Some("rateLimits"));
        assert_eq!(cloud.count(HttpMethod::Patch, "queues/idle"), 0);

        let infra = queues.get_config(&ctx).await.unwrap().unwrap();
        assert_eq!(
            infra.values["CLOUDTASK_QUEUE_WORK"],
            "projects/proj/locations/us-central1/queues/work"
        );
    }

    #[tokio::test]
    async fn test_enqueue_posts_task() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        client()
            .enqueue(&cloud, &clients, "https://app.run.app", "target", None, &TaskOptions::default())
            .await
            .unwrap();
        let create = cloud.calls_to(HttpMethod::Post, "queues/work/tasks");
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].body.as_ref().unwrap()["task"]["httpRequest"]["url"], "https://app.run.app");
    }
}
