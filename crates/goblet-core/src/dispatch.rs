//! Runtime event classification.
//!
//! An inbound invocation is classified by an ordered rule list; the first
//! rule that matches decides the [`EventKind`]. Order matters: a Pub/Sub
//! push request has a non-empty path and would otherwise look like a route.

use crate::error::{GobletError, GobletResult};
use crate::request::{EventContext, Request};
use std::fmt;

pub const TASK_INDEX_ENV: &str = "CLOUD_RUN_TASK_INDEX";

pub const HEADER_TYPE: &str = "X-Goblet-Type";
pub const HEADER_NAME: &str = "X-Goblet-Name";
pub const HEADER_UPTIME_NAME: &str = "X-Goblet-Uptime-Name";
pub const HEADER_CLOUDTASK_TARGET: &str = "X-Goblet-CloudTask-Target";
pub const HEADER_ENVOY_PATH: &str = "X-Envoy-Original-Path";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Job,
    PubSub,
    Storage,
    Schedule,
    Uptime,
    CloudTaskTarget,
    Eventarc,
    BqRemoteFunction,
    Http,
    Route,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Job => "job",
            EventKind::PubSub => "pubsub",
            EventKind::Storage => "storage",
            EventKind::Schedule => "schedule",
            EventKind::Uptime => "uptime",
            EventKind::CloudTaskTarget => "cloudtasktarget",
            EventKind::Eventarc => "eventarc",
            EventKind::BqRemoteFunction => "bqremotefunction",
            EventKind::Http => "http",
            EventKind::Route => "route",
        }
    }

    /// Kind named by a background event type, e.g. `google.pubsub.topic.publish`
    /// or `providers/cloud.pubsub/eventTypes/topic.publish`. The `google.cloud.`
    /// prefix of 2nd gen event types is skipped.
    pub fn from_event_type(event_type: &str) -> Option<EventKind> {
        let rest = event_type.split_once('.')?.1;
        let rest = rest.strip_prefix("cloud.").unwrap_or(rest);
        let segment = rest.split(['.', '/']).next()?;
        match segment {
            "pubsub" => Some(EventKind::PubSub),
            "storage" => Some(EventKind::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process environment consulted by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub task_index: Option<u32>,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        Self {
            task_index: std::env::var(TASK_INDEX_ENV)
                .ok()
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn with_task_index(index: u32) -> Self {
        Self {
            task_index: Some(index),
        }
    }
}

struct Inbound<'a> {
    request: &'a Request,
    context: Option<&'a EventContext>,
    env: &'a RuntimeEnv,
}

type Rule = fn(&Inbound<'_>) -> Option<GobletResult<EventKind>>;

/// First match wins. A non-empty event type is final: an unrecognised one
/// is an error rather than falling through to the request rules. The
/// `X-Goblet-Uptime-Name` rule is an extension placed after schedules.
const RULES: &[Rule] = &[
    |i| i.env.task_index.map(|_| Ok(EventKind::Job)),
    |i| {
        i.context.filter(|c| !c.event_type.is_empty()).map(|c| {
            EventKind::from_event_type(&c.event_type)
                .ok_or_else(|| GobletError::UnknownEventKind(c.event_type.clone()))
        })
    },
    |i| (i.request.header(HEADER_TYPE) == Some("schedule")).then_some(Ok(EventKind::Schedule)),
    |i| i.request.has_header(HEADER_UPTIME_NAME).then_some(Ok(EventKind::Uptime)),
    |i| (i.request.header("User-Agent") == Some("Google-Cloud-Tasks")).then_some(Ok(EventKind::CloudTaskTarget)),
    |i| (i.request.has_header("Ce-Type") && i.request.has_header("Ce-Source")).then_some(Ok(EventKind::Eventarc)),
    |i| {
        i.request
            .json_object()
            .and_then(|b| b.get("userDefinedContext"))
            .and_then(|c| c.get(HEADER_NAME))
            .filter(|n| !n.is_null())
            .map(|_| Ok(EventKind::BqRemoteFunction))
    },
    |i| {
        i.request
            .json_object()
            .filter(|b| truthy(b.get("subscription")) && truthy(b.get("message")))
            .map(|_| Ok(EventKind::PubSub))
    },
    |i| (i.request.path == "/" && !i.request.has_header(HEADER_ENVOY_PATH)).then_some(Ok(EventKind::Http)),
    |i| (!i.request.path.is_empty()).then_some(Ok(EventKind::Route)),
];

fn truthy(value: Option<&serde_json::Value>) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(serde_json::Value::Object(m)) => !m.is_empty(),
        Some(_) => true,
    }
}

/// Classify an invocation; unmatched invocations are `UnknownEventKind`.
pub fn classify(request: &Request, context: Option<&EventContext>, env: &RuntimeEnv) -> GobletResult<EventKind> {
    let inbound = Inbound { request, context, env };
    RULES.iter().find_map(|rule| rule(&inbound)).unwrap_or_else(|| {
        Err(GobletError::UnknownEventKind(format!("{} {}", request.method, request.path)))
    })
}
