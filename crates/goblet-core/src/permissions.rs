//! Deployment identity: the custom role and service account a CI system
//! uses to deploy an app with least privilege.

use crate::error::{GobletError, GobletResult};
use goblet_gcp::{CloudApi, Verb, VersionedClients};
use log::info;
use serde_json::{json, Value};

const CRUD: [&str; 5] = ["create", "get", "delete", "update", "list"];

/// `{service}.{resource}.{create,get,delete,update,list}`
pub fn gcp_generic_resource_permissions(service: &str, resource: &str) -> Vec<String> {
    CRUD.iter()
        .map(|verb| format!("{}.{}.{}", service, resource, verb))
        .collect()
}

/// Role ids allow only letters, digits, `_` and `.`, so the app name is
/// camel-cased: `goblet-test` → `GobletDeploymentGobletTest`.
pub fn deployment_role_id(app: &str) -> String {
    let camel: String = app
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    format!("GobletDeployment{}", camel)
}

/// Sorted, de-duplicated permission list.
pub fn normalize(mut permissions: Vec<String>) -> Vec<String> {
    permissions.sort();
    permissions.dedup();
    permissions
}

/// Create (or update the permissions of) the app's deployment role.
pub async fn create_custom_role(
    api: &dyn CloudApi,
    clients: &VersionedClients,
    app: &str,
    permissions: Vec<String>,
) -> GobletResult<Value> {
    let role_id = deployment_role_id(app);
    let permissions = normalize(permissions);
    let roles = clients.iam_roles();
    let body = json!({
        "roleId": role_id,
        "role": {
            "title": format!("Deployment role for {}", app),
            "description": format!("Goblet generated role for application {}", app),
            "includedPermissions": permissions,
            "stage": "GA",
        }
    });
    match roles
        .execute(api, Verb::Create, Some("projects/{project_id}"), Some(body), &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(resp) => {
            info!(target: "goblet::deployer", "created custom role {}", role_id);
            Ok(resp)
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "updating custom role {}", role_id);
            let name = format!("projects/{{project_id}}/roles/{}", role_id);
            Ok(roles
                .execute(
                    api,
                    Verb::Patch,
                    Some(&name),
                    Some(json!({ "includedPermissions": permissions })),
                    &[("updateMask", "includedPermissions")],
                )
                .await?)
        }
        Err(e) => Err(e),
    }
}

/// Create the `{app}-deployer` service account; an existing one is returned.
pub async fn create_service_account(
    api: &dyn CloudApi,
    clients: &VersionedClients,
    app: &str,
) -> GobletResult<Value> {
    let account_id = format!("{}-deployer", app);
    let accounts = clients.iam_service_accounts();
    let body = json!({
        "accountId": account_id,
        "serviceAccount": {
            "displayName": account_id,
            "description": format!("Goblet deployment account for application {}", app),
        }
    });
    match accounts
        .execute(api, Verb::Create, Some("projects/{project_id}"), Some(body), &[])
        .await
        .map_err(GobletError::from)
    {
        Ok(resp) => {
            info!(target: "goblet::deployer", "created service account {}", account_id);
            Ok(resp)
        }
        Err(e) if e.is_already_exists() => {
            info!(target: "goblet::deployer", "service account {} already exists", account_id);
            let email = format!("{}@{}.iam.gserviceaccount.com", account_id, api.context().project_id);
            let name = format!("projects/{{project_id}}/serviceAccounts/{}", email);
            Ok(accounts.execute(api, Verb::Get, Some(&name), None, &[]).await?)
        }
        Err(e) => Err(e),
    }
}
