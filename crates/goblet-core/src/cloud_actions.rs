//! Cloud calls shared by backends and handlers.
//!
//! All helpers follow the same reconcile policy: a 409 on create turns
//! into a patch, a 404 on delete is success, everything else propagates.

use crate::backends::{md5_from_goog_hash, SourceHandle};
use crate::config::GConfig;
use crate::error::{GobletError, GobletResult};
use crate::resource::DeployContext;
use crate::utils::update_mask;
use goblet_gcp::{default_project_number, list_all, StorageClient, Verb};
use log::info;
use serde_json::{json, Map, Value};

fn not_found_as_none(result: Result<Value, GobletError>) -> GobletResult<Option<Value>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

// ── Service Usage ───────────────────────────────────────────────────────

/// Enable every API in `apis` (short names, e.g. `run`) that is not
/// enabled yet.
pub async fn check_or_enable_services(ctx: &DeployContext<'_>, apis: &[&str]) -> GobletResult<()> {
    let services = ctx.clients.service_usage();
    let list = services.call(ctx.api.context(), &Verb::List, None, None, &[("filter", "state:ENABLED")]);
    let enabled: Vec<String> = list_all(ctx.api, list, "services")
        .await?
        .iter()
        .filter_map(|s| s.get("config").and_then(|c| c.get("name")).and_then(|n| n.as_str()))
        .map(str::to_string)
        .collect();

    let mut missing: Vec<String> = apis
        .iter()
        .map(|api| format!("{}.googleapis.com", api))
        .filter(|id| !enabled.contains(id))
        .collect();
    missing.sort();
    missing.dedup();
    if missing.is_empty() {
        info!(target: "goblet::deployer", "required apis already enabled");
        return Ok(());
    }
    info!(target: "goblet::deployer", "enabling apis {}", missing.join(", "));
    let op = services
        .execute(
            ctx.api,
            Verb::CollectionCustom("batchEnable"),
            None,
            Some(json!({ "serviceIds": missing })),
            &[],
        )
        .await?;
    services.wait_for_operation(ctx.api, &op, ctx.poll).await?;
    Ok(())
}

// ── Cloud Functions ─────────────────────────────────────────────────────

pub fn function_path(ctx: &DeployContext<'_>, name: &str) -> String {
    format!("projects/{}/locations/{}/functions/{}", ctx.project(), ctx.location(), name)
}

/// The configured runtime. Python runtimes must meet the API minimum
/// (`python37` for v1, `python38` for v2).
pub fn function_runtime(config: &GConfig, version: &str) -> GobletResult<String> {
    let runtime = config.str_value("runtime").ok_or_else(|| {
        GobletError::validation("runtime must be set in config.json for cloudfunction backends")
    })?;
    let required = if version == "v1" { 37 } else { 38 };
    if let Some(Ok(found)) = runtime.strip_prefix("python").map(str::parse::<u32>) {
        if found < required {
            return Err(GobletError::validation(format!(
                "runtime {} is below the minimum python{} for cloudfunctions {}",
                runtime, required, version
            )));
        }
    }
    Ok(runtime)
}

pub async fn get_cloudfunction(ctx: &DeployContext<'_>, name: &str) -> GobletResult<Option<Value>> {
    let path = function_path(ctx, name);
    let resp = ctx
        .clients
        .cloudfunctions()
        .execute(ctx.api, Verb::Get, Some(&path), None, &[])
        .await;
    not_found_as_none(resp.map_err(GobletError::from))
}

/// Create the function described by `body` (patch on 409), wait, then
/// apply `bindings` from config.
pub async fn create_cloudfunction(ctx: &DeployContext<'_>, body: Value, config: &GConfig) -> GobletResult<()> {
    let functions = ctx.clients.cloudfunctions();
    let full_name = body.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let function_id = full_name.rsplit('/').next().unwrap_or_default().to_string();
    let query: Vec<(&str, &str)> = if functions.version == "v1" {
        Vec::new()
    } else {
        vec![("functionId", function_id.as_str())]
    };
    let op = match functions
        .execute(ctx.api, Verb::Create, None, Some(body.clone()), &query)
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            info!(target: "goblet::deployer", "creating cloudfunction {}", function_id);
            op
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating cloudfunction {}", function_id);
            functions
                .execute(ctx.api, Verb::Patch, Some(&full_name), Some(body), &[])
                .await?
        }
        Err(e) => return Err(e),
    };
    functions.wait_for_operation(ctx.api, &op, ctx.poll).await?;

    let bindings = config.bindings();
    if !bindings.is_empty() {
        info!(target: "goblet::deployer", "adding IAM bindings for cloudfunction {}", function_id);
        functions
            .execute(
                ctx.api,
                Verb::Custom("setIamPolicy"),
                Some(&full_name),
                Some(json!({ "policy": { "bindings": bindings } })),
                &[],
            )
            .await?;
    }
    Ok(())
}

pub async fn destroy_cloudfunction(ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
    let functions = ctx.clients.cloudfunctions();
    let path = function_path(ctx, name);
    match functions
        .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            info!(target: "goblet::deployer", "deleting google cloudfunction {}......", name);
            functions.wait_for_operation(ctx.api, &op, ctx.poll).await?;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(target: "goblet::deployer", "cloudfunction {} already destroyed", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete the uploaded source archives kept in `gcf-sources-{number}-{location}`.
pub async fn destroy_cloudfunction_artifacts(ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
    let number = default_project_number(ctx.api, ctx.clients).await?;
    let bucket = format!("gcf-sources-{}-{}", number, ctx.location());
    let objects = match StorageClient::list_objects(ctx.api, &bucket, Some(name)).await {
        Ok(objects) => objects,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    if objects.is_empty() {
        info!(target: "goblet::deployer", "artifacts already deleted");
        return Ok(());
    }
    for object in objects {
        info!(target: "goblet::deployer", "deleting artifact {}", object.name);
        StorageClient::delete_object(ctx.api, &bucket, &object.name).await?;
    }
    Ok(())
}

/// md5 of the deployed source, or `None` when the function does not exist.
pub async fn deployed_function_checksum(ctx: &DeployContext<'_>, name: &str) -> GobletResult<Option<String>> {
    if get_cloudfunction(ctx, name).await?.is_none() {
        return Ok(None);
    }
    let path = function_path(ctx, name);
    let info = ctx
        .clients
        .cloudfunctions()
        .execute(ctx.api, Verb::Custom("generateDownloadUrl"), Some(&path), Some(json!({})), &[])
        .await?;
    let Some(url) = info.get("downloadUrl").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let headers = ctx.api.head(url).await?;
    Ok(headers.get("x-goog-hash").and_then(|h| md5_from_goog_hash(h)))
}

/// `generateUploadUrl` then PUT the archive to the signed URL.
pub async fn upload_function_source(
    ctx: &DeployContext<'_>,
    archive: Vec<u8>,
    headers: &[(String, String)],
    checksum: String,
) -> GobletResult<SourceHandle> {
    let resp = ctx
        .clients
        .cloudfunctions()
        .execute(ctx.api, Verb::CollectionCustom("generateUploadUrl"), None, Some(json!({})), &[])
        .await?;
    let upload_url = resp
        .get("uploadUrl")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GobletError::validation("generateUploadUrl returned no uploadUrl"))?
        .to_string();
    info!(target: "goblet::deployer", "uploading source zip to gs......");
    ctx.api.upload(&upload_url, headers, archive).await?;
    info!(target: "goblet::deployer", "function code uploaded");
    Ok(SourceHandle {
        upload_url,
        storage_source: resp.get("storageSource").cloned(),
        checksum,
    })
}

/// HTTPS trigger URL of a deployed function.
pub async fn get_cloudfunction_url(ctx: &DeployContext<'_>, name: &str) -> GobletResult<String> {
    if ctx.clients.cloudfunctions().version == "v1" {
        return Ok(format!(
            "https://{}-{}.cloudfunctions.net/{}",
            ctx.location(),
            ctx.project(),
            name
        ));
    }
    let function = get_cloudfunction(ctx, name)
        .await?
        .ok_or_else(|| GobletError::NotFound(format!("cloudfunction {}", name)))?;
    function
        .get("httpsTrigger")
        .and_then(|t| t.get("url"))
        .or_else(|| function.get("serviceConfig").and_then(|s| s.get("uri")))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GobletError::NotFound(format!("url for cloudfunction {}", name)))
}

// ── Cloud Build / Cloud Run ─────────────────────────────────────────────

/// Image repository a source build pushes to.
pub fn artifact_registry(ctx: &DeployContext<'_>, config: &GConfig, name: &str) -> String {
    config
        .get_path(&["deploy", "artifact_registry"])
        .or_else(|| config.get_path(&["cloudbuild", "artifact_registry"]))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}-docker.pkg.dev/{}/cloud-run-source-deploy/{}",
                ctx.location(),
                ctx.project(),
                name
            )
        })
}

/// `{image}@{digest}` of the newest successful build for `name`.
pub async fn cloudbuild_artifact(ctx: &DeployContext<'_>, config: &GConfig, name: &str) -> GobletResult<String> {
    let registry = artifact_registry(ctx, config, name);
    let tagged = format!("{}:", registry);
    let resp = ctx
        .clients
        .cloudbuild()
        .execute(ctx.api, Verb::List, None, None, &[])
        .await?;
    let builds = resp.get("builds").and_then(|b| b.as_array()).cloned().unwrap_or_default();
    for build in &builds {
        // pending builds have no results
        let Some(image) = build
            .get("results")
            .and_then(|r| r.get("images"))
            .and_then(|i| i.get(0))
        else {
            continue;
        };
        let image_name = image.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        if image_name == registry || image_name.starts_with(&tagged) {
            let digest = image.get("digest").and_then(|v| v.as_str()).unwrap_or_default();
            return Ok(format!("{}@{}", registry, digest));
        }
    }
    Err(GobletError::Build("Missing artifact. Cloud Build may have failed.".to_string()))
}

pub fn service_path(ctx: &DeployContext<'_>, name: &str) -> String {
    format!("projects/{}/locations/{}/services/{}", ctx.project(), ctx.location(), name)
}

pub async fn get_cloudrun(ctx: &DeployContext<'_>, name: &str) -> GobletResult<Option<Value>> {
    let path = service_path(ctx, name);
    let resp = ctx.clients.run().execute(ctx.api, Verb::Get, Some(&path), None, &[]).await;
    not_found_as_none(resp.map_err(GobletError::from))
}

/// Create the service (patch on 409) and wait for the rollout.
pub async fn deploy_cloudrun(ctx: &DeployContext<'_>, body: Value, name: &str) -> GobletResult<()> {
    let run = ctx.clients.run();
    let op = match run
        .execute(ctx.api, Verb::Create, None, Some(body.clone()), &[("serviceId", name)])
        .await
        .map_err(GobletError::from)
    {
        Ok(op) => {
            info!(target: "goblet::deployer", "creating cloudrun {}", name);
            op
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating cloudrun {}", name);
            let path = service_path(ctx, name);
            run.execute(ctx.api, Verb::Patch, Some(&path), Some(body), &[]).await?
        }
        Err(e) => return Err(e),
    };
    run.wait_for_operation(ctx.api, &op, ctx.poll).await?;
    Ok(())
}

pub async fn destroy_cloudrun(ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
    let path = service_path(ctx, name);
    match ctx
        .clients
        .run()
        .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(_) => {
            info!(target: "goblet::deployer", "deleting cloudrun {}......", name);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(target: "goblet::deployer", "cloudrun {} already destroyed", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Service URL (`uri` on v2, `status.url` on v1).
pub async fn get_cloudrun_url(ctx: &DeployContext<'_>, name: &str) -> GobletResult<String> {
    let service = get_cloudrun(ctx, name)
        .await?
        .ok_or_else(|| GobletError::NotFound(format!("cloudrun {}", name)))?;
    service
        .get("status")
        .and_then(|s| s.get("url"))
        .or_else(|| service.get("uri"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GobletError::NotFound(format!("url for cloudrun {}", name)))
}

// ── Pub/Sub Subscriptions ───────────────────────────────────────────────

const SUBSCRIPTION_IMMUTABLE: &[&str] = &["name", "topic", "filter", "enableMessageOrdering"];

/// Create `projects/P/subscriptions/{name}`. On 409 patch the mutable
/// fields, or delete and recreate when `force_update` is set.
pub async fn create_pubsub_subscription(
    ctx: &DeployContext<'_>,
    name: &str,
    body: Value,
    force_update: bool,
) -> GobletResult<()> {
    let subs = ctx.clients.pubsub();
    let path = format!("projects/{{project_id}}/subscriptions/{}", name);
    match subs
        .execute(ctx.api, Verb::Put, Some(&path), Some(body.clone()), &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(_) => {
            info!(target: "goblet::deployer", "creating pubsub subscription {}", name);
            Ok(())
        }
        Err(e) if e.is_already_exists() && force_update => {
            info!(target: "goblet::deployer", "recreating pubsub subscription {}", name);
            subs.execute(ctx.api, Verb::Delete, Some(&path), None, &[]).await?;
            subs.execute(ctx.api, Verb::Put, Some(&path), Some(body), &[]).await?;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating pubsub subscription {}", name);
            let mask = body
                .as_object()
                .map(|b| update_mask(b, SUBSCRIPTION_IMMUTABLE))
                .unwrap_or_default();
            subs.execute(
                ctx.api,
                Verb::Patch,
                Some(&path),
                Some(json!({ "subscription": body, "updateMask": mask })),
                &[],
            )
            .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn destroy_pubsub_subscription(ctx: &DeployContext<'_>, name: &str) -> GobletResult<()> {
    let path = format!("projects/{{project_id}}/subscriptions/{}", name);
    match ctx
        .clients
        .pubsub()
        .execute(ctx.api, Verb::Delete, Some(&path), None, &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(_) => {
            info!(target: "goblet::deployer", "deleting pubsub subscription {}......", name);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(target: "goblet::deployer", "pubsub subscription {} already destroyed", name);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ── Eventarc ────────────────────────────────────────────────────────────

pub async fn create_eventarc_trigger(
    ctx: &DeployContext<'_>,
    trigger: &str,
    region: &str,
    body: Map<String, Value>,
) -> GobletResult<()> {
    let triggers = ctx.clients.eventarc();
    let parent = format!("projects/{{project_id}}/locations/{}", region);
    let call = triggers
        .execute(
            ctx.api,
            Verb::Create,
            Some(&parent),
            Some(Value::Object(body.clone())),
            &[("triggerId", trigger), ("validateOnly", "false")],
        )
        .await
        .map_err(GobletError::from);
    match call {
        Ok(_) => {
            info!(target: "goblet::deployer", "creating eventarc trigger {}", trigger);
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating eventarc trigger {}", trigger);
            let mask = update_mask(&body, &["name", "transport"]);
            let name = format!("{}/triggers/{}", parent, trigger);
            triggers
                .execute(
                    ctx.api,
                    Verb::Patch,
                    Some(&name),
                    Some(Value::Object(body)),
                    &[("updateMask", mask.as_str())],
                )
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn destroy_eventarc_trigger(ctx: &DeployContext<'_>, trigger: &str, region: &str) -> GobletResult<()> {
    let name = format!("projects/{{project_id}}/locations/{}/triggers/{}", region, trigger);
    match ctx
        .clients
        .eventarc()
        .execute(ctx.api, Verb::Delete, Some(&name), None, &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(_) => {
            info!(target: "goblet::deployer", "deleting eventarc trigger {}......", trigger);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(target: "goblet::deployer", "eventarc trigger {} already destroyed", trigger);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use goblet_gcp::{FakeCloud, HttpMethod, VersionedClients};

    fn with_ctx<F>(cloud: &FakeCloud, clients: &VersionedClients, config: &GConfig, f: F)
    where
        F: FnOnce(DeployContext<'_>),
    {
        f(DeployContext::new(cloud, clients, config, "app", BackendKind::CloudRun));
    }

    #[test]
    fn test_runtime_minimums() {
        let config = GConfig::new(json!({"runtime": "python37"}));
        assert_eq!(function_runtime(&config, "v1").unwrap(), "python37");
        assert!(function_runtime(&config, "v2").is_err());
        let node = GConfig::new(json!({"runtime": "nodejs20"}));
        assert_eq!(function_runtime(&node, "v2").unwrap(), "nodejs20");
    }

    #[test]
    fn test_artifact_registry_default() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let clients = VersionedClients::default();
        let config = GConfig::default();
        with_ctx(&cloud, &clients, &config, |ctx| {
            assert_eq!(
                artifact_registry(&ctx, &config, "app"),
                "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app"
            );
            let custom = GConfig::new(json!({"deploy": {"artifact_registry": "eu-docker.pkg.dev/p/r/app"}}));
            assert_eq!(artifact_registry(&ctx, &custom, "app"), "eu-docker.pkg.dev/p/r/app");
        });
    }

    #[tokio::test]
    async fn test_cloudbuild_artifact_skips_pending_builds() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "projects/proj/builds",
            json!({"builds": [
                {"id": "pending"},
                {"results": {"images": [{"name": "other", "digest": "sha256:0"}]}},
                {"results": {"images": [{"name": "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app:latest", "digest": "sha256:1"}]}},
            ]}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let artifact = cloudbuild_artifact(&ctx, &config, "app").await.unwrap();
        assert_eq!(artifact, "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/app@sha256:1");

        let empty = FakeCloud::new("proj", "us-central1");
        let ctx = DeployContext::new(&empty, &clients, &config, "app", BackendKind::CloudRun);
        assert!(matches!(
            cloudbuild_artifact(&ctx, &config, "app").await,
            Err(GobletError::Build(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_conflict_patches_narrow_mask() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail_once(HttpMethod::Put, "subscriptions/app-t", 409);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        let body = json!({
            "name": "projects/proj/subscriptions/app-t",
            "topic": "projects/proj/topics/t",
            "filter": "",
            "enableMessageOrdering": false,
            "ackDeadlineSeconds": 30,
            "pushConfig": {},
        });
        create_pubsub_subscription(&ctx, "app-t", body, false).await.unwrap();
        let patch = &cloud.calls_to(HttpMethod::Patch, "subscriptions/app-t")[0];
        assert_eq!(patch.body.as_ref().unwrap()["updateMask"], "ackDeadlineSeconds,pushConfig");
    }

    #[tokio::test]
    async fn test_subscription_force_update_recreates() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail_once(HttpMethod::Put, "subscriptions/app-t", 409);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        create_pubsub_subscription(&ctx, "app-t", json!({"name": "n"}), true).await.unwrap();
        assert_eq!(cloud.count(HttpMethod::Delete, "subscriptions/app-t"), 1);
        assert_eq!(cloud.count(HttpMethod::Put, "subscriptions/app-t"), 2);
        assert_eq!(cloud.count(HttpMethod::Patch, "subscriptions/app-t"), 0);
    }

    #[tokio::test]
    async fn test_enable_only_missing_services() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "projects/proj/services",
            json!({"services": [{"config": {"name": "run.googleapis.com"}}]}),
        );
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        check_or_enable_services(&ctx, &["run", "cloudscheduler", "run"]).await.unwrap();
        let enable = &cloud.calls_to(HttpMethod::Post, "services:batchEnable")[0];
        assert_eq!(
            enable.body.as_ref().unwrap()["serviceIds"],
            json!(["cloudscheduler.googleapis.com"])
        );
    }

    #[tokio::test]
    async fn test_delete_missing_trigger_is_ok() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Delete, "triggers/app-t", 404);
        let clients = VersionedClients::default();
        let config = GConfig::default();
        let ctx = DeployContext::new(&cloud, &clients, &config, "app", BackendKind::CloudRun);
        destroy_eventarc_trigger(&ctx, "app-t", "us-central1").await.unwrap();
    }
}
