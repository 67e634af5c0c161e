//! # goblet-core – deploy-and-dispatch engine
//!
//! Registers user functions against trigger kinds, deploys the cloud
//! resources that deliver those triggers, and routes each incoming
//! invocation back to the right function.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Goblet  (app.rs)                                    │
//! │  ├── registration: route · schedule · topic · …      │
//! │  ├── dispatch: classify → before → handler → after   │
//! │  └── deploy / destroy / sync                         │
//! ├──────────────────────────────────────────────────────┤
//! │  ResourceManager  (manager.rs)                       │
//! │  ├── handlers/         one per trigger kind          │
//! │  ├── infrastructures/  topics, redis, queues, …      │
//! │  └── backends/         Cloud Functions v1/v2, Run    │
//! ├──────────────────────────────────────────────────────┤
//! │  Resource · Handler · Infrastructure  (resource.rs)  │
//! ├──────────────────────────────────────────────────────┤
//! │  goblet-gcp  versioned collections + LRO polling     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module            | Purpose                                          |
//! |-------------------|--------------------------------------------------|
//! | `error`           | `GobletError` and API error classification       |
//! | `config`          | `GConfig`: `.goblet/config.json` + stages        |
//! | `request`         | Runtime request, response and event context      |
//! | `resource`        | Resource traits and the deploy context           |
//! | `dispatch`        | Event classification rules                       |
//! | `middleware`      | Before/after chains keyed by event kind          |
//! | `handlers`        | Trigger kinds with deploy and dispatch           |
//! | `infrastructures` | Trigger-independent cloud resources              |
//! | `backends`        | Compute the user code runs on                    |
//! | `cloud_actions`   | Shared cloud calls (service usage, functions)    |
//! | `openapi`         | OpenAPI 2.0 generation for routes                |
//! | `permissions`     | Deployment role and service account              |
//! | `manager`         | Deploy/destroy/sync ordering                     |
//! | `app`             | The `Goblet` application                         |
//! | `utils`           | Naming, masks and attribute filters              |

pub mod error;
pub mod config;
pub mod request;
pub mod resource;
pub mod dispatch;
pub mod middleware;
pub mod handlers;
pub mod infrastructures;
pub mod backends;
pub mod cloud_actions;
pub mod openapi;
pub mod permissions;
pub mod manager;
pub mod app;
pub mod utils;

// ── Re-exports for ergonomic access ─────────────────────────────────────

pub use app::{Goblet, JobOptions};
pub use backends::{Backend, BackendKind, FileSource, ImageBuilder, SourcePackager, StaticSource};
pub use config::GConfig;
pub use dispatch::{classify, EventKind, RuntimeEnv};
pub use error::{GobletError, GobletResult};
pub use manager::{DeployOptions, ResourceManager};
pub use middleware::Selector;
pub use request::{EventContext, Request, Response};
pub use resource::{DeployContext, Handler, InfraConfig, Infrastructure, Resource};
