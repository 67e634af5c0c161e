//! The contract shared by every deployable resource.
//!
//! ```text
//!            Resource  deploy · destroy · sync · required_apis · permissions
//!           ┌───┴────────────┐
//!       Handler         Infrastructure
//!   dispatch(request)   get_config → InfraConfig → Backend::update_config
//! ```

use crate::backends::{Backend, BackendKind};
use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::request::{EventContext, Request, Response};
use async_trait::async_trait;
use goblet_gcp::{CloudApi, PollSettings, VersionedClients};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

// ── Deploy Context ──────────────────────────────────────────────────────

/// Everything a resource needs while talking to the cloud. Cheap to copy;
/// nothing in it is mutated during a deploy.
#[derive(Clone, Copy)]
pub struct DeployContext<'a> {
    pub api: &'a dyn CloudApi,
    pub clients: &'a VersionedClients,
    pub config: &'a GConfig,
    pub app_name: &'a str,
    pub backend_kind: BackendKind,
    pub poll: PollSettings,
    /// Project root; deploy artifacts go to `{root}/.goblet`.
    pub root: &'a Path,
    backend: Option<&'a dyn Backend>,
}

impl<'a> DeployContext<'a> {
    pub fn new(
        api: &'a dyn CloudApi,
        clients: &'a VersionedClients,
        config: &'a GConfig,
        app_name: &'a str,
        backend_kind: BackendKind,
    ) -> Self {
        Self {
            api,
            clients,
            config,
            app_name,
            backend_kind,
            poll: PollSettings::default(),
            root: Path::new("."),
            backend: None,
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_root(mut self, root: &'a Path) -> Self {
        self.root = root;
        self
    }

    pub fn with_backend(mut self, backend: &'a dyn Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The deployed backend. Handlers only run after it exists.
    pub fn backend(&self) -> GobletResult<&'a dyn Backend> {
        self.backend
            .ok_or_else(|| GobletError::validation("no backend available in this deploy phase"))
    }

    pub fn project(&self) -> &'a str {
        &self.api.context().project_id
    }

    pub fn location(&self) -> &'a str {
        &self.api.context().location
    }

    /// Substitute `{project_id}` / `{location_id}`.
    pub fn render(&self, schema: &str) -> String {
        self.api.context().render(schema)
    }
}

// ── Traits ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait Resource: Send + Sync {
    fn resource_type(&self) -> &'static str;

    fn valid_backends(&self) -> &'static [BackendKind] {
        BackendKind::ALL
    }

    fn required_apis(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn permissions(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_empty(&self) -> bool;

    /// Whether [`Resource::sync`] removes stale cloud resources.
    fn can_sync(&self) -> bool {
        false
    }

    async fn deploy(&mut self, ctx: &DeployContext<'_>) -> GobletResult<()>;

    async fn destroy(&self, ctx: &DeployContext<'_>) -> GobletResult<()>;

    /// Delete `{app}-` prefixed cloud resources that are no longer
    /// registered. With `dryrun` only log them.
    async fn sync(&self, _ctx: &DeployContext<'_>, _dryrun: bool) -> GobletResult<()> {
        Ok(())
    }
}

/// A trigger kind with request-time dispatch.
pub trait Handler: Resource {
    fn dispatch(&self, request: &Request, context: Option<&EventContext>) -> GobletResult<Response>;

    /// Principals that must be able to invoke the backend.
    fn service_accounts(&self, _config: &GConfig) -> Vec<String> {
        Vec::new()
    }
}

/// Values an infrastructure contributes to the backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    pub resource_type: String,
    pub values: Map<String, Value>,
}

impl InfraConfig {
    pub fn new(resource_type: &str, values: Map<String, Value>) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            values,
        }
    }
}

#[async_trait]
pub trait Infrastructure: Resource {
    async fn get_config(&self, _ctx: &DeployContext<'_>) -> GobletResult<Option<InfraConfig>> {
        Ok(None)
    }
}

/// Deploy unless empty; reject a backend the resource cannot run on.
pub async fn deploy_checked<R>(resource: &mut R, ctx: &DeployContext<'_>) -> GobletResult<()>
where
    R: Resource + ?Sized,
{
    if resource.is_empty() {
        return Ok(());
    }
    if !resource.valid_backends().contains(&ctx.backend_kind) {
        return Err(GobletError::validation(format!(
            "{} not supported for {}",
            ctx.backend_kind,
            resource.resource_type()
        )));
    }
    info!(target: "goblet::deployer", "deploying {}", resource.resource_type());
    resource.deploy(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblet_gcp::FakeCloud;

    struct Probe {
        names: Vec<String>,
        deployed: bool,
    }

    #[async_trait]
    impl Resource for Probe {
        fn resource_type(&self) -> &'static str {
            "probe"
        }

        fn valid_backends(&self) -> &'static [BackendKind] {
            &[BackendKind::CloudRun]
        }

        fn is_empty(&self) -> bool {
            self.names.is_empty()
        }

        async fn deploy(&mut self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
            self.deployed = true;
            Ok(())
        }

        async fn destroy(&self, _ctx: &DeployContext<'_>) -> GobletResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_resource_skips_backend_check() {
        let cloud = FakeCloud::new("p", "l");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudFunction);
        let mut probe = Probe { names: vec![], deployed: false };
        deploy_checked(&mut probe, &ctx).await.unwrap();
        assert!(!probe.deployed);
    }

    #[tokio::test]
    async fn test_wrong_backend_is_validation_error() {
        let cloud = FakeCloud::new("p", "l");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudFunction);
        let mut probe = Probe { names: vec!["x".into()], deployed: false };
        let err = deploy_checked(&mut probe, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("cloudfunction not supported for probe"));

        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        deploy_checked(&mut probe, &ctx).await.unwrap();
        assert!(probe.deployed);
        assert_eq!(ctx.render("projects/{project_id}/locations/{location_id}"), "projects/p/locations/l");
        assert!(ctx.backend().is_err());
    }
}
