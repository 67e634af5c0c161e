//! # goblet-gcp – Google Cloud API invoker
//!
//! Authenticated access to the Google Cloud REST APIs that goblet deploys
//! against, expressed as versioned collections with a uniform verb set and
//! long-running operation polling.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  VersionedClients  (catalog.rs)                  │
//! │  └── Collection per service/version:             │
//! │       execute(verb, parent_schema, body, query)  │
//! │       wait_for_operation  (operation.rs)         │
//! ├──────────────────────────────────────────────────┤
//! │  iam.rs · storage.rs   helpers over collections  │
//! ├──────────────────────────────────────────────────┤
//! │  CloudApi  (api.rs)                              │
//! │  ├── GcpClient  (client.rs)   reqwest + bearer   │
//! │  └── FakeCloud  (testing.rs)  in-memory recorder │
//! ├──────────────────────────────────────────────────┤
//! │  TokenManager  (auth.rs)                         │
//! │  └── JWT → access_token exchange + caching       │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module      | Purpose                                             |
//! |-------------|-----------------------------------------------------|
//! | `error`     | `GcpError` and the Google error envelope            |
//! | `config`    | Service-account keys, project/location context      |
//! | `auth`      | OAuth2 token acquisition and caching                |
//! | `api`       | `ApiCall` and the `CloudApi` transport trait        |
//! | `client`    | HTTPS transport and pagination                      |
//! | `catalog`   | Versioned collections and verb → URL mapping        |
//! | `operation` | Long-running operation polling                      |
//! | `iam`       | `getIamPolicy` / `setIamPolicy` binding merge       |
//! | `storage`   | Cloud Storage buckets and objects                   |
//! | `testing`   | `FakeCloud` for unit and end-to-end tests           |

// ── Sub-modules ─────────────────────────────────────────────────────────

pub mod error;
pub mod config;
pub mod auth;
pub mod api;
pub mod client;
pub mod catalog;
pub mod operation;
pub mod iam;
pub mod storage;
pub mod testing;

// ── Re-exports for ergonomic access ─────────────────────────────────────

pub use api::{ApiCall, CloudApi, HttpMethod};
pub use auth::{Credentials, TokenManager};
pub use catalog::{
    default_project_number, Collection, Verb, VersionedClients, GLOBAL_SCHEMA, LOCATION_SCHEMA,
    PROJECT_SCHEMA,
};
pub use client::{list_all, GcpClient};
pub use config::{CloudContext, ServiceAccountKey};
pub use error::{GcpError, GcpResult};
pub use operation::{wait_for_operation, OperationState, PollSettings};
pub use storage::StorageClient;
pub use testing::FakeCloud;
