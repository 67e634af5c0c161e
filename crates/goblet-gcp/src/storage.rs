//! Google Cloud Storage helpers.
//!
//! Covers the bucket lifecycle needed for uploaded artifacts: create,
//! list objects by prefix, delete objects and buckets, media upload.
//!
//! API base: `https://storage.googleapis.com/storage/v1`

use crate::api::{ApiCall, CloudApi, HttpMethod};
use crate::client::list_all;
use crate::error::GcpResult;
use log::info;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SERVICE: &str = "storage";
const V1: &str = "storage/v1";

/// Object names are a single path segment in the JSON API.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ── Types ───────────────────────────────────────────────────────────────

/// Cloud Storage object (blob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub size: String,
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(default, rename = "md5Hash")]
    pub md5_hash: Option<String>,
}

impl Object {
    /// `gs://bucket/name` form used by BigQuery and Dataproc.
    pub fn gs_uri(&self) -> String {
        gs_uri(&self.bucket, &self.name)
    }
}

pub fn gs_uri(bucket: &str, name: &str) -> String {
    format!("gs://{}/{}", bucket, name)
}

fn encode(name: &str) -> String {
    utf8_percent_encode(name, OBJECT_NAME).to_string()
}

// ── Storage Client ──────────────────────────────────────────────────────

pub struct StorageClient;

impl StorageClient {
    // ── Buckets ──────────────────────────────────────────────────────

    /// Create a bucket. Returns `false` when it already exists.
    pub async fn create_bucket(
        api: &dyn CloudApi,
        name: &str,
        location: &str,
    ) -> GcpResult<bool> {
        let project = api.context().project_id.clone();
        let call = ApiCall::new(SERVICE, HttpMethod::Post, format!("{}/b", V1))
            .with_query("project", project)
            .with_body(json!({ "name": name, "location": location }));
        match api.send(call).await {
            Ok(_) => {
                info!(target: "goblet::deployer", "bucket {} created", name);
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                info!(target: "goblet::deployer", "storage bucket {} already exists", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete an (empty) bucket. A missing bucket is not an error.
    pub async fn delete_bucket(api: &dyn CloudApi, name: &str) -> GcpResult<()> {
        let call = ApiCall::new(SERVICE, HttpMethod::Delete, format!("{}/b/{}", V1, name));
        match api.send(call).await {
            Ok(_) => {
                info!(target: "goblet::deployer", "bucket {} deleted", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "bucket {} already deleted", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete every object, then the bucket itself.
    pub async fn delete_bucket_force(api: &dyn CloudApi, name: &str) -> GcpResult<()> {
        let objects = match Self::list_objects(api, name, None).await {
            Ok(objects) => objects,
            Err(e) if e.is_not_found() => {
                info!(target: "goblet::deployer", "bucket {} already deleted", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for object in &objects {
            Self::delete_object(api, name, &object.name).await?;
        }
        Self::delete_bucket(api, name).await
    }

    // ── Objects ──────────────────────────────────────────────────────

    pub async fn list_objects(
        api: &dyn CloudApi,
        bucket: &str,
        prefix: Option<&str>,
    ) -> GcpResult<Vec<Object>> {
        let mut call = ApiCall::new(SERVICE, HttpMethod::Get, format!("{}/b/{}/o", V1, bucket));
        if let Some(p) = prefix {
            call = call.with_query("prefix", p);
        }
        let items = list_all(api, call, "items").await?;
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Delete one object. A missing object is not an error.
    pub async fn delete_object(api: &dyn CloudApi, bucket: &str, name: &str) -> GcpResult<()> {
        let path = format!("{}/b/{}/o/{}", V1, bucket, encode(name));
        match api.send(ApiCall::new(SERVICE, HttpMethod::Delete, path)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Simple media upload; returns the object's `gs://` URI.
    pub async fn upload_object(
        api: &dyn CloudApi,
        bucket: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> GcpResult<String> {
        let path = format!("upload/{}/b/{}/o", V1, bucket);
        let query = vec![
            ("uploadType".to_string(), "media".to_string()),
            ("name".to_string(), name.to_string()),
        ];
        let resp: Value = api
            .upload_media(SERVICE, &path, &query, content_type, data)
            .await?;
        let stored = resp
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(name)
            .to_string();
        info!(target: "goblet::deployer", "uploaded {} to bucket {}", stored, bucket);
        Ok(gs_uri(bucket, &stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;

    #[test]
    fn object_names_are_percent_encoded() {
        assert_eq!(encode("dir/file name.py"), "dir%2Ffile%20name.py");
        assert_eq!(encode("plain-file_1.zip"), "plain-file_1.zip");
    }

    #[tokio::test]
    async fn create_bucket_tolerates_conflict() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail_once(HttpMethod::Post, "storage/v1/b", 409);
        let created = StorageClient::create_bucket(&cloud, "proj-app", "us-central1")
            .await
            .unwrap();
        assert!(!created);
        let call = &cloud.calls()[0];
        assert_eq!(call.query_value("project"), Some("proj"));
        assert_eq!(call.body.as_ref().unwrap()["name"], "proj-app");
    }

    #[tokio::test]
    async fn force_delete_empties_bucket_first() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.on(
            HttpMethod::Get,
            "storage/v1/b/bkt/o",
            json!({"items": [{"name": "a/b.py", "bucket": "bkt"}, {"name": "c.zip", "bucket": "bkt"}]}),
        );
        StorageClient::delete_bucket_force(&cloud, "bkt").await.unwrap();

        let deletes: Vec<String> = cloud
            .calls_to(HttpMethod::Delete, "storage/v1/b/bkt")
            .into_iter()
            .map(|c| c.path)
            .collect();
        assert_eq!(
            deletes,
            vec![
                "storage/v1/b/bkt/o/a%2Fb.py".to_string(),
                "storage/v1/b/bkt/o/c.zip".to_string(),
                "storage/v1/b/bkt".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_bucket_is_not_an_error() {
        let cloud = FakeCloud::new("proj", "us-central1");
        cloud.fail(HttpMethod::Get, "storage/v1/b/gone/o", 404);
        StorageClient::delete_bucket_force(&cloud, "gone").await.unwrap();
        assert!(cloud.calls_to(HttpMethod::Delete, "gone").is_empty());
    }

    #[tokio::test]
    async fn upload_returns_gs_uri() {
        let cloud = FakeCloud::new("proj", "us-central1");
        let uri = StorageClient::upload_object(&cloud, "bkt", "spark.py", "text/x-python", b"print(1)".to_vec())
            .await
            .unwrap();
        assert_eq!(uri, "gs://bkt/spark.py");
        let uploads = cloud.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].url, "storage/upload/storage/v1/b/bkt/o?name=spark.py");
        assert_eq!(uploads[0].size, 8);
    }
}
