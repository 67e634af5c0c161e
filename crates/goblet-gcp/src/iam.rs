//! IAM policy helpers shared by every resource type.
//!
//! Policies are read with `{resource}:getIamPolicy` and written with
//! `{resource}:setIamPolicy` on the resource's own service.

use crate::api::CloudApi;
use crate::catalog::{Collection, Verb};
use crate::error::{GcpError, GcpResult};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Types ───────────────────────────────────────────────────────────────

/// IAM policy binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBinding {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl PolicyBinding {
    pub fn new(role: &str, members: &[String]) -> Self {
        Self {
            role: role.to_string(),
            members: members.to_vec(),
        }
    }
}

/// IAM policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IamPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl IamPolicy {
    /// Add `member` to `role`. Returns false when already bound.
    pub fn grant(&mut self, role: &str, member: &str) -> bool {
        if let Some(binding) = self.bindings.iter_mut().find(|b| b.role == role) {
            if binding.members.iter().any(|m| m == member) {
                return false;
            }
            binding.members.push(member.to_string());
            return true;
        }
        self.bindings.push(PolicyBinding::new(role, &[member.to_string()]));
        true
    }
}

// ── Operations ──────────────────────────────────────────────────────────

fn get_verb(collection: &Collection) -> Verb {
    // Resource Manager exposes getIamPolicy as POST, the resource APIs as GET.
    if collection.service == "cloudresourcemanager" {
        Verb::Custom("getIamPolicy")
    } else {
        Verb::CustomGet("getIamPolicy")
    }
}

pub async fn get_policy(
    api: &dyn CloudApi,
    collection: &Collection,
    resource: &str,
) -> GcpResult<IamPolicy> {
    let body = if collection.service == "cloudresourcemanager" {
        Some(json!({}))
    } else {
        None
    };
    let raw = collection
        .execute(api, get_verb(collection), Some(resource), body, &[])
        .await?;
    serde_json::from_value(raw)
        .map_err(|e| GcpError::from_str(collection.service, &format!("bad IAM policy: {}", e)))
}

/// Replace the policy on `resource`.
pub async fn set_policy(
    api: &dyn CloudApi,
    collection: &Collection,
    resource: &str,
    policy: &IamPolicy,
) -> GcpResult<()> {
    collection
        .execute(
            api,
            Verb::Custom("setIamPolicy"),
            Some(resource),
            Some(json!({ "policy": policy })),
            &[],
        )
        .await?;
    Ok(())
}

/// Read-modify-write a single role binding; no write when already bound.
pub async fn add_binding(
    api: &dyn CloudApi,
    collection: &Collection,
    resource: &str,
    role: &str,
    member: &str,
) -> GcpResult<()> {
    let mut policy = get_policy(api, collection, resource).await?;
    if !policy.grant(role, member) {
        return Ok(());
    }
    set_policy(api, collection, resource, &policy).await?;
    info!(target: "goblet::deployer", "granted {} to {} on {}", role, member, api.context().render(resource));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpMethod;
    use crate::catalog::VersionedClients;
    use crate::testing::FakeCloud;

    #[test]
    fn grant_merges_members() {
        let mut policy = IamPolicy::default();
        assert!(policy.grant("roles/run.invoker", "serviceAccount:a@x"));
        assert!(policy.grant("roles/run.invoker", "serviceAccount:b@x"));
        assert!(!policy.grant("roles/run.invoker", "serviceAccount:a@x"));
        assert_eq!(policy.bindings.len(), 1);
        assert_eq!(policy.bindings[0].members.len(), 2);
    }

    #[tokio::test]
    async fn add_binding_reads_then_writes() {
        let cloud = FakeCloud::new("p", "l");
        cloud.on(
            HttpMethod::Get,
            "subscriptions/app-t:getIamPolicy",
            json!({"bindings": [{"role": "roles/viewer", "members": ["user:x"]}], "etag": "abc"}),
        );
        let subs = VersionedClients::default().pubsub();
        add_binding(
            &cloud,
            &subs,
            "projects/{project_id}/subscriptions/app-t",
            "roles/pubsub.subscriber",
            "serviceAccount:sa@x",
        )
        .await
        .unwrap();

        let sets = cloud.calls_to(HttpMethod::Post, ":setIamPolicy");
        assert_eq!(sets.len(), 1);
        let body = sets[0].body.clone().unwrap();
        assert_eq!(body["policy"]["etag"], "abc");
        assert_eq!(body["policy"]["bindings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn add_binding_noop_when_present() {
        let cloud = FakeCloud::new("p", "l");
        cloud.on(
            HttpMethod::Get,
            ":getIamPolicy",
            json!({"bindings": [{"role": "roles/pubsub.publisher", "members": ["serviceAccount:sa@x"]}]}),
        );
        let topics = VersionedClients::default().pubsub_topic();
        add_binding(&cloud, &topics, "projects/p/topics/t", "roles/pubsub.publisher", "serviceAccount:sa@x")
            .await
            .unwrap();
        assert!(cloud.writes().is_empty());
    }
}
