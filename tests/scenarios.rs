//! End-to-end deploy, sync and dispatch flows against the in-memory cloud.

use async_trait::async_trait;
use goblet::goblet_core::backends::cloudrun::{source_label, SOURCE_LABEL};
use goblet::goblet_core::backends::ImageBuilder;
use goblet::goblet_gcp::HttpMethod;
use goblet::{
    BackendKind, BqParamType, DeployContext, DeployOptions, EventarcOptions, FakeCloud, GConfig, Goblet, GobletError,
    GobletResult, Request, Response, RouteOptions, RoutineOptions, RuntimeEnv, ScheduleOptions, StaticSource,
    SubscriptionOptions,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const RUN_URL: &str = "https://goblet-test-xyz.a.run.app";

#[derive(Default)]
struct CountingBuilder(AtomicUsize);

#[async_trait]
impl ImageBuilder for CountingBuilder {
    async fn build(&self, _ctx: &DeployContext<'_>, _config: &GConfig, _name: &str) -> GobletResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn run_app(config: Value, builder: Arc<CountingBuilder>) -> Goblet {
    Goblet::with_config("goblet-test", BackendKind::CloudRun, GConfig::new(config))
        .with_packager(Arc::new(StaticSource(b"print('hello')".to_vec())))
        .with_image_builder(builder)
}

/// Stubs a live Cloud Run service plus a finished build for it.
fn stub_service(cloud: &FakeCloud) {
    // getIamPolicy shares the service path, so it is matched first
    cloud.on(HttpMethod::Get, "services/goblet-test:getIamPolicy", json!({}));
    cloud.on(HttpMethod::Get, "services/goblet-test", json!({"uri": RUN_URL, "labels": {}}));
    cloud.on(
        HttpMethod::Get,
        "projects/proj/builds",
        json!({"builds": [{"results": {"images": [{
            "name": "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/goblet-test",
            "digest": "sha256:abc"
        }]}}]}),
    );
}

#[tokio::test]
async fn test_schedule_on_cloudrun_targets_service_url() {
    let cloud = FakeCloud::new("proj", "us-central1");
    stub_service(&cloud);
    let builder = Arc::new(CountingBuilder::default());
    let mut app = run_app(
        json!({"scheduler": {"serviceAccount": "sched@proj.iam.gserviceaccount.com"}}),
        builder.clone(),
    );
    app.schedule("f", "* * * * *", Arc::new(|| Response::from("ok")), ScheduleOptions::default());

    app.deploy(&cloud, DeployOptions::default()).await.unwrap();
    assert_eq!(builder.0.load(Ordering::SeqCst), 1);

    let jobs = cloud.calls_to(HttpMethod::Post, "locations/us-central1/jobs");
    assert_eq!(jobs.len(), 1);
    let body = jobs[0].body.as_ref().unwrap();
    assert_eq!(body["name"], "projects/proj/locations/us-central1/jobs/goblet-test-f");
    assert_eq!(body["schedule"], "* * * * *");
    assert_eq!(body["httpTarget"]["uri"], RUN_URL);
    assert_eq!(body["httpTarget"]["headers"]["X-Goblet-Type"], "schedule");
    assert_eq!(body["httpTarget"]["headers"]["X-Goblet-Name"], "f");
    assert_eq!(
        body["httpTarget"]["oidcToken"]["serviceAccountEmail"],
        "sched@proj.iam.gserviceaccount.com"
    );
}

#[tokio::test]
async fn test_pubsub_dlq_survives_denied_grants() {
    let cloud = FakeCloud::new("proj", "us-central1");
    stub_service(&cloud);
    cloud.fail(HttpMethod::Post, "topics/t-dlq:setIamPolicy", 403);
    cloud.fail(HttpMethod::Post, "subscriptions/goblet-test-t:setIamPolicy", 403);
    let mut app = run_app(
        json!({"pubsub": {"serviceAccountEmail": "push@proj.iam.gserviceaccount.com"}}),
        Arc::new(CountingBuilder::default()),
    );
    app.pubsub_topic("t", Map::new(), true);
    app.topic(
        "on_t",
        "t",
        Arc::new(|data: &str| json!(data)),
        SubscriptionOptions::subscription().with_dlq(),
    );

    app.deploy(&cloud, DeployOptions::default()).await.unwrap();

    let put_paths: Vec<String> = cloud
        .calls()
        .into_iter()
        .filter(|c| c.method == HttpMethod::Put)
        .map(|c| c.path)
        .collect();
    for suffix in ["topics/t", "topics/t-dlq", "subscriptions/t-dlq-pull", "subscriptions/goblet-test-t"] {
        assert!(
            put_paths.iter().any(|p| p.ends_with(suffix)),
            "missing PUT {} in {:?}",
            suffix,
            put_paths
        );
    }

    let subscription = cloud
        .calls()
        .into_iter()
        .find(|c| c.method == HttpMethod::Put && c.path.ends_with("subscriptions/goblet-test-t"))
        .unwrap();
    let body = subscription.body.unwrap();
    assert_eq!(body["deadLetterPolicy"]["deadLetterTopic"], "projects/proj/topics/t-dlq");
    assert_eq!(body["pushConfig"]["pushEndpoint"], RUN_URL);

    assert_eq!(cloud.count(HttpMethod::Post, "topics/t-dlq:setIamPolicy"), 1);
    assert_eq!(cloud.count(HttpMethod::Post, "subscriptions/goblet-test-t:setIamPolicy"), 1);
}

#[tokio::test]
async fn test_duplicate_route_is_rejected_before_any_call() {
    let cloud = FakeCloud::new("proj", "us-central1");
    let mut app = Goblet::new("goblet-test", BackendKind::CloudFunction);
    app.route("first", "/h", Arc::new(|_: &Request, _: &BTreeMap<String, String>| Response::from("1")), RouteOptions::default())
        .unwrap();

    let err = app
        .route("second", "/h", Arc::new(|_: &Request, _: &BTreeMap<String, String>| Response::from("2")), RouteOptions::default())
        .unwrap_err();
    match err {
        GobletError::Validation(message) => {
            assert!(message.contains("first"));
            assert!(message.contains("second"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_eventarc_sync_only_deletes_when_not_dry_run() {
    let cloud = FakeCloud::new("proj", "us-central1");
    cloud.on(
        HttpMethod::Get,
        "locations/us-central1/triggers",
        json!({"triggers": [
            {"name": "projects/proj/locations/us-central1/triggers/goblet-test-t1"},
            {"name": "projects/proj/locations/us-central1/triggers/goblet-test-t2"},
            {"name": "projects/proj/locations/us-central1/triggers/other-app-x"},
        ]}),
    );
    let mut app = Goblet::new("goblet-test", BackendKind::CloudRun);
    app.eventarc(
        "t1",
        Arc::new(|_: &Request| Response::from("ok")),
        EventarcOptions::default().with_topic("events"),
    );

    app.sync(&cloud, true).await.unwrap();
    assert_eq!(cloud.count(HttpMethod::Delete, "triggers/"), 0);

    app.sync(&cloud, false).await.unwrap();
    let deletes = cloud.calls_to(HttpMethod::Delete, "triggers/");
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].path.ends_with("locations/us-central1/triggers/goblet-test-t2"));
}

#[test]
fn test_bigquery_remote_function_dispatch() {
    let mut app = Goblet::new("app", BackendKind::CloudRun);
    let routine = app.bq_remote_function(
        "mult",
        Arc::new(|args: &[Value]| {
            let product: i64 = args.iter().filter_map(Value::as_i64).product();
            json!(product)
        }),
        RoutineOptions::new("ds", BqParamType::Int64)
            .arg("x", BqParamType::Int64)
            .arg("y", BqParamType::Int64),
    );
    assert_eq!(routine, "app_mult");

    let request = Request::post("/").with_json(json!({
        "userDefinedContext": {"X-Goblet-Name": "app_mult"},
        "calls": [[2, 3], [4, 5]],
    }));
    let response = app.dispatch(request, None, &RuntimeEnv::default()).unwrap();
    assert_eq!(response.body, json!({"replies": [6, 20]}));
}

#[tokio::test]
async fn test_redeploy_of_unchanged_source_matches_written_label() {
    let cloud = FakeCloud::new("proj", "us-central1");
    cloud.fail_once(HttpMethod::Get, "services/goblet-test", 404);
    cloud.on(
        HttpMethod::Get,
        "projects/proj/builds",
        json!({"builds": [{"results": {"images": [{
            "name": "us-central1-docker.pkg.dev/proj/cloud-run-source-deploy/goblet-test",
            "digest": "sha256:abc"
        }]}}]}),
    );
    let builder = Arc::new(CountingBuilder::default());
    let mut app = run_app(json!({}), builder.clone());

    app.deploy(&cloud, DeployOptions::default()).await.unwrap();
    assert_eq!(builder.0.load(Ordering::SeqCst), 1);
    let created = cloud.calls_to(HttpMethod::Post, "locations/us-central1/services");
    assert_eq!(created.len(), 1);
    let labels = created[0].body.as_ref().unwrap()["labels"].clone();
    assert_eq!(labels[SOURCE_LABEL], source_label(b"print('hello')"));

    // the service now reports what the first deploy wrote
    cloud.on(HttpMethod::Get, "services/goblet-test", json!({"uri": RUN_URL, "labels": labels}));
    cloud.reset_calls();

    app.deploy(&cloud, DeployOptions::default()).await.unwrap();
    assert_eq!(builder.0.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.count(HttpMethod::Post, "locations/us-central1/services"), 0);
    assert_eq!(cloud.count(HttpMethod::Patch, "services/goblet-test"), 0);

    app.deploy(&cloud, DeployOptions::forced()).await.unwrap();
    assert_eq!(builder.0.load(Ordering::SeqCst), 2);
}
