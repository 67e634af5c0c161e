//! Trigger handlers: each owns the registrations of one trigger kind, the
//! cloud resources that deliver those triggers, and request-time dispatch.
//!
//! | Handler              | Cloud resource                     | Dispatch key                     |
//! |----------------------|------------------------------------|----------------------------------|
//! | `routes`             | API Gateway                        | path + method                    |
//! | `scheduler`          | Cloud Scheduler job                | `X-Goblet-Name`                  |
//! | `pubsub`             | push subscription / CF trigger     | topic + attributes               |
//! | `storage`            | CF storage trigger                 | bucket + event                   |
//! | `eventarc`           | Eventarc trigger                   | `/x-goblet-eventarc-triggers/..` |
//! | `http`               | none                               | required headers                 |
//! | `jobs`               | Cloud Run job                      | job name + task index            |
//! | `bq_remote_function` | BigQuery connection + routine      | `userDefinedContext`             |
//! | `cloudtask_target`   | none                               | `X-Goblet-CloudTask-Target`      |
//! | `uptime`             | Monitoring uptime check            | `X-Goblet-Uptime-Name`           |

pub mod bq_remote_function;
pub mod cloudtask_target;
pub mod eventarc;
pub mod http;
pub mod jobs;
pub mod pubsub;
pub mod routes;
pub mod scheduler;
pub mod storage;
pub mod uptime;

pub use bq_remote_function::{BqParamType, BqRemoteFunction, RoutineOptions};
pub use cloudtask_target::CloudTaskTarget;
pub use eventarc::{Eventarc, EventarcOptions};
pub use http::Http;
pub use jobs::{job_schedule_options, Jobs};
pub use pubsub::{PubSub, SubscriptionOptions};
pub use routes::{CorsConfig, RouteEntry, RouteOptions, Routes, RoutesType};
pub use scheduler::{AuthMethod, ScheduleOptions, Scheduler};
pub use storage::Storage;
pub use uptime::Uptime;

use crate::request::{Request, Response};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

// ── User Function Types ─────────────────────────────────────────────────

/// Route handler: request plus the values of the path placeholders.
pub type RouteFn = Arc<dyn Fn(&Request, &BTreeMap<String, String>) -> Response + Send + Sync>;
/// Schedule and uptime handlers take no arguments.
pub type NoArgFn = Arc<dyn Fn() -> Response + Send + Sync>;
/// Eventarc, http and cloud task targets receive the raw request.
pub type RequestFn = Arc<dyn Fn(&Request) -> Response + Send + Sync>;
/// Pub/Sub handlers receive the decoded message data.
pub type PubSubFn = Arc<dyn Fn(&str) -> Value + Send + Sync>;
/// Storage handlers receive the object metadata event.
pub type StorageFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Job tasks receive their task index.
pub type JobFn = Arc<dyn Fn(u32) -> Value + Send + Sync>;
/// BigQuery remote functions receive one row of arguments (or, vectorized,
/// one column per argument).
pub type BqFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
