//! Compute backends: where the user code runs.
//!
//! | Backend            | Service version key | Supported versions        |
//! |--------------------|---------------------|---------------------------|
//! | `cloudfunction`    | `cloudfunctions`    | `v1`                      |
//! | `cloudfunctionv2`  | `cloudfunctions`    | `v2beta`, `v2alpha`, `v2` |
//! | `cloudrun`         | `run`               | `v2`                      |
//!
//! Every backend packages (or builds) the source, compares its checksum
//! against what is deployed and only creates or patches the compute
//! resource when something changed or the deploy is forced.

pub mod cloudfunction_v1;
pub mod cloudfunction_v2;
pub mod cloudrun;

pub use cloudfunction_v1::CloudFunctionV1;
pub use cloudfunction_v2::CloudFunctionV2;
pub use cloudrun::{CloudRun, GcloudBuilder, ImageBuilder};

use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::resource::{DeployContext, InfraConfig};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goblet_gcp::Verb;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Entry point every function-based deployment exposes.
pub const ENTRY_POINT: &str = "goblet_entrypoint";

// ── Backend Kind ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    CloudFunction,
    CloudFunctionV2,
    CloudRun,
}

impl BackendKind {
    pub const ALL: &'static [BackendKind] = &[
        BackendKind::CloudFunction,
        BackendKind::CloudFunctionV2,
        BackendKind::CloudRun,
    ];

    pub const FUNCTIONS: &'static [BackendKind] =
        &[BackendKind::CloudFunction, BackendKind::CloudFunctionV2];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::CloudFunction => "cloudfunction",
            BackendKind::CloudFunctionV2 => "cloudfunctionv2",
            BackendKind::CloudRun => "cloudrun",
        }
    }

    /// The `client_versions` key that pins this backend's API.
    pub fn version_key(&self) -> &'static str {
        match self {
            BackendKind::CloudRun => "run",
            _ => "cloudfunctions",
        }
    }

    pub fn supported_versions(&self) -> &'static [&'static str] {
        match self {
            BackendKind::CloudFunction => &["v1"],
            BackendKind::CloudFunctionV2 => &["v2beta", "v2alpha", "v2"],
            BackendKind::CloudRun => &["v2"],
        }
    }

    /// Version used when `client_versions` does not pin one.
    pub fn default_version(&self) -> &'static str {
        self.supported_versions().last().copied().unwrap_or("v1")
    }

    pub fn is_cloudfunction(&self) -> bool {
        !matches!(self, BackendKind::CloudRun)
    }

    /// Cloud Monitoring resource type for uptime checks and alerts.
    pub fn monitoring_type(&self) -> &'static str {
        match self {
            BackendKind::CloudRun => "cloud_run_revision",
            _ => "cloud_function",
        }
    }

    /// Monitoring label holding the service/function name.
    pub fn monitoring_label_key(&self) -> &'static str {
        match self {
            BackendKind::CloudRun => "service_name",
            _ => "function_name",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = GobletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloudfunction" => Ok(BackendKind::CloudFunction),
            "cloudfunctionv2" => Ok(BackendKind::CloudFunctionV2),
            "cloudrun" => Ok(BackendKind::CloudRun),
            other => Err(GobletError::validation(format!(
                "backend {} is not supported, expected one of cloudfunction, cloudfunctionv2, cloudrun",
                other
            ))),
        }
    }
}

// ── Source ──────────────────────────────────────────────────────────────

/// base64(md5(bytes)), the form Cloud Storage reports in `x-goog-hash`.
pub fn source_checksum(bytes: &[u8]) -> String {
    STANDARD.encode(Md5::digest(bytes))
}

/// Produces the deployable source archive.
pub trait SourcePackager: Send + Sync {
    fn package(&self, config: &GConfig) -> GobletResult<Vec<u8>>;
}

/// In-memory archive.
pub struct StaticSource(pub Vec<u8>);

impl SourcePackager for StaticSource {
    fn package(&self, _config: &GConfig) -> GobletResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// A prebuilt archive on disk, usually `.goblet/{name}.zip`.
pub struct FileSource(pub PathBuf);

impl SourcePackager for FileSource {
    fn package(&self, _config: &GConfig) -> GobletResult<Vec<u8>> {
        Ok(std::fs::read(&self.0)?)
    }
}

/// Where the uploaded source lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHandle {
    pub upload_url: String,
    /// Cloud Functions v2 `storageSource`.
    pub storage_source: Option<Value>,
    pub checksum: String,
}

/// A background Cloud Function wired to an event trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFunction {
    /// Function id, e.g. `{app}-topic-{topic}`.
    pub name: String,
    /// The version-specific `eventTrigger` body.
    pub trigger: Value,
}

// ── Backend Trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Function or service name.
    fn name(&self) -> &str;

    /// The app config with every infrastructure overlay applied.
    fn config(&self) -> &GConfig;

    fn required_apis(&self) -> Vec<&'static str>;

    fn permissions(&self) -> Vec<String>;

    /// Source uploaded by the last [`Backend::deploy`], if it changed.
    fn source(&self) -> Option<&SourceHandle>;

    /// Runtime identity configured for the compute resource.
    fn service_account(&self) -> Option<String>;

    /// Request timeout configured for the compute resource.
    fn timeout_secs(&self) -> Option<u64>;

    /// Package, compare, upload and (for `http`) create or patch the
    /// compute resource. `None` when nothing changed.
    async fn deploy(
        &mut self,
        ctx: &DeployContext<'_>,
        force: bool,
        http: bool,
    ) -> GobletResult<Option<SourceHandle>>;

    async fn destroy(&self, ctx: &DeployContext<'_>, purge_artifacts: bool) -> GobletResult<()>;

    async fn http_endpoint(&self, ctx: &DeployContext<'_>) -> GobletResult<String>;

    /// Plain variables plus secret-manager references resolved to values.
    async fn get_environment_vars(&self, ctx: &DeployContext<'_>) -> GobletResult<Map<String, Value>>;

    async fn add_invoker_binding(&self, ctx: &DeployContext<'_>, principals: &[String]) -> GobletResult<()>;

    /// Fold infrastructure outputs into the backend config.
    fn update_config(&mut self, infra_configs: &[InfraConfig]);

    /// Deploy a background function from the uploaded source.
    async fn deploy_event_function(&self, ctx: &DeployContext<'_>, function: &EventFunction) -> GobletResult<()>;
}

/// Build the backend for `kind`.
pub fn create_backend(
    kind: BackendKind,
    name: &str,
    config: GConfig,
    packager: Arc<dyn SourcePackager>,
    builder: Arc<dyn ImageBuilder>,
) -> Box<dyn Backend> {
    match kind {
        BackendKind::CloudFunction => Box::new(CloudFunctionV1::new(name, config, packager)),
        BackendKind::CloudFunctionV2 => Box::new(CloudFunctionV2::new(name, config, packager)),
        BackendKind::CloudRun => Box::new(CloudRun::new(name, config, packager, builder)),
    }
}

// ── Shared Helpers ──────────────────────────────────────────────────────

/// `x-goog-hash: crc32c=...,md5=...` → the md5 value.
pub fn md5_from_goog_hash(header: &str) -> Option<String> {
    header
        .split(',')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("md5="))
        .map(str::to_string)
}

/// Read `projects/P/secrets/{secret}/versions/{version}:access`.
pub async fn access_secret(ctx: &DeployContext<'_>, secret: &str, version: &str) -> GobletResult<String> {
    let name = format!("projects/{{project_id}}/secrets/{}/versions/{}", secret, version);
    let resp = ctx
        .clients
        .secretmanager()
        .execute(ctx.api, Verb::CustomGet("access"), Some(&name), None, &[])
        .await?;
    let data = resp
        .get("payload")
        .and_then(|p| p.get("data"))
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| GobletError::validation(format!("secret {} is not base64: {}", secret, e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Resolve `[{key, secret, version}]` entries (Cloud Functions form).
pub async fn resolve_function_secrets(
    ctx: &DeployContext<'_>,
    entries: Option<&Value>,
    out: &mut Map<String, Value>,
) -> GobletResult<()> {
    for entry in entries.and_then(|v| v.as_array()).into_iter().flatten() {
        let (Some(key), Some(secret)) = (
            entry.get("key").and_then(|v| v.as_str()),
            entry.get("secret").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let version = entry.get("version").and_then(|v| v.as_str()).unwrap_or("latest");
        out.insert(key.to_string(), Value::String(access_secret(ctx, secret, version).await?));
    }
    Ok(())
}

/// Environment-variable values contributed by `redis` / `cloudtaskqueue`.
pub fn infra_environment(infra_configs: &[InfraConfig]) -> Map<String, Value> {
    let mut env = Map::new();
    for infra in infra_configs {
        if matches!(infra.resource_type.as_str(), "redis" | "cloudtaskqueue") {
            for (k, v) in &infra.values {
                env.insert(k.clone(), v.clone());
            }
        }
    }
    env
}

/// `(connector name, egress)` contributed by a VPC connector.
pub fn infra_vpc_connector(infra_configs: &[InfraConfig]) -> Option<(Value, Value)> {
    infra_configs
        .iter()
        .find(|c| c.resource_type == "vpcconnector")
        .map(|c| {
            (
                c.values.get("name").cloned().unwrap_or(Value::Null),
                c.values.get("egress").cloned().unwrap_or(Value::Null),
            )
        })
}

/// Parse `"60s"` / `60` into seconds.
pub fn parse_seconds(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim_end_matches('s').parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_versions() {
        assert_eq!(BackendKind::CloudFunction.default_version(), "v1");
        assert_eq!(BackendKind::CloudFunctionV2.default_version(), "v2");
        assert_eq!(BackendKind::CloudRun.version_key(), "run");
        assert!(BackendKind::CloudFunctionV2.supported_versions().contains(&"v2beta"));
        assert_eq!("cloudrun".parse::<BackendKind>().unwrap(), BackendKind::CloudRun);
        assert!("lambda".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_checksum_matches_storage_format() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(source_checksum(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(
            md5_from_goog_hash("crc32c=AAAAAA==,md5=1B2M2Y8AsgTpgAmY7PhCfg=="),
            Some("1B2M2Y8AsgTpgAmY7PhCfg==".to_string())
        );
        assert_eq!(md5_from_goog_hash("crc32c=AAAAAA=="), None);
    }

    #[test]
    fn test_infra_outputs() {
        let configs = vec![
            InfraConfig::new("redis", json!({"REDIS_HOST": "10.0.0.1"}).as_object().unwrap().clone()),
            InfraConfig::new(
                "vpcconnector",
                json!({"name": "projects/p/locations/l/connectors/c", "egress": "PRIVATE_RANGES_ONLY"})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        ];
        assert_eq!(infra_environment(&configs)["REDIS_HOST"], "10.0.0.1");
        let (name, egress) = infra_vpc_connector(&configs).unwrap();
        assert_eq!(name, "projects/p/locations/l/connectors/c");
        assert_eq!(egress, "PRIVATE_RANGES_ONLY");
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds(Some(&json!("540s"))), Some(540));
        assert_eq!(parse_seconds(Some(&json!(30))), Some(30));
        assert_eq!(parse_seconds(None), None);
    }
}
