//! # goblet
//!
//! Write handlers for Google Cloud triggers in one app, deploy every cloud
//! resource that delivers those triggers, and dispatch each invocation back
//! to its handler at runtime.
//!
//! ```no_run
//! use goblet::{BackendKind, Goblet, Request, Response, RuntimeEnv, ScheduleOptions};
//! use std::sync::Arc;
//!
//! let mut app = Goblet::new("reports", BackendKind::CloudRun);
//! app.schedule("nightly", "0 0 * * *", Arc::new(|| Response::from("done")), ScheduleOptions::default());
//!
//! let request = Request::get("/")
//!     .with_header("X-Goblet-Type", "schedule")
//!     .with_header("X-Goblet-Name", "nightly");
//! let response = app.dispatch(request, None, &RuntimeEnv::from_env());
//! ```
//!
//! | Crate         | Role                                                  |
//! |---------------|-------------------------------------------------------|
//! | `goblet-core` | handlers, infrastructures, backends, dispatcher       |
//! | `goblet-gcp`  | authenticated REST collections and operation polling  |

pub mod logging;

pub use goblet_core::handlers::{
    AuthMethod, BqParamType, CorsConfig, EventarcOptions, RouteOptions, RoutesType, RoutineOptions,
    ScheduleOptions, SubscriptionOptions,
};
pub use goblet_core::infrastructures::{
    Alert, AlertCondition, AlertTarget, CloudTaskClient, PubSubClient, SparkProcedureOptions, TaskOptions,
};
pub use goblet_core::{
    classify, Backend, BackendKind, DeployContext, DeployOptions, EventContext, EventKind, FileSource, GConfig,
    Goblet, GobletError, GobletResult, JobOptions, Request, Response, RuntimeEnv, Selector, SourcePackager,
    StaticSource,
};
pub use goblet_gcp::{CloudApi, CloudContext, Credentials, FakeCloud, GcpClient, GcpError, PollSettings};

/// The engine and cloud crates, for anything not re-exported here.
pub use goblet_core;
pub use goblet_gcp;
