//! Naming, filter and field-mask helpers shared across resources.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Cloud name of an app-owned resource: `{app}-{id}`.
pub fn app_resource_name(app: &str, id: &str) -> String {
    format!("{}-{}", app, id)
}

/// Hyphenated variant for APIs that reject underscores.
pub fn hyphenate(name: &str) -> String {
    name.replace('_', "-")
}

/// The last `/`-separated segment of a fully-qualified cloud name.
pub fn short_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Pub/Sub subscription filter matching every attribute,
/// e.g. `attributes.env = "prod" AND attributes.kind = "a"`.
pub fn attributes_to_filter(attributes: &BTreeMap<String, String>) -> String {
    attributes
        .iter()
        .map(|(k, v)| format!("attributes.{} = \"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// True when every key/value of `attrs` is present in `message`.
pub fn attributes_match(attrs: &BTreeMap<String, String>, message: &BTreeMap<String, String>) -> bool {
    attrs.iter().all(|(k, v)| message.get(k) == Some(v))
}

/// `desired` is contained in `live`: objects compare key by key (extra live
/// keys are ignored), everything else by equality.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d
            .iter()
            .all(|(k, v)| l.get(k).map(|lv| is_subset(v, lv)).unwrap_or(v.is_null())),
        (d, l) => d == l,
    }
}

/// Top-level keys of `desired` that differ from the deployed resource.
pub fn changed_keys(desired: &Map<String, Value>, live: &Value, exclude: &[&str]) -> Vec<String> {
    desired
        .iter()
        .filter(|(k, _)| !exclude.contains(&k.as_str()))
        .filter(|(k, v)| !live.get(k.as_str()).map(|lv| is_subset(v, lv)).unwrap_or(false))
        .map(|(k, _)| k.clone())
        .collect()
}

/// Comma-joined update mask over `body` keys minus `exclude`.
pub fn update_mask(body: &Map<String, Value>, exclude: &[&str]) -> String {
    body.keys()
        .filter(|k| !exclude.contains(&k.as_str()))
        .cloned()
        .collect::<Vec<_>>()
        .join(",")
}

/// Shallow merge: `overlay` keys win.
pub fn extend(mut base: Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    for (k, v) in overlay {
        base.insert(k.clone(), v.clone());
    }
    base
}

/// A string map parsed from a JSON object; non-string values are stringified.
pub fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_filter_from_attributes() {
        let filter = attributes_to_filter(&attrs(&[("env", "prod"), ("kind", "a")]));
        assert_eq!(filter, "attributes.env = \"prod\" AND attributes.kind = \"a\"");
        assert_eq!(attributes_to_filter(&BTreeMap::new()), "");
    }

    #[test]
    fn test_attribute_subset() {
        let message = attrs(&[("env", "prod"), ("kind", "a")]);
        assert!(attributes_match(&attrs(&[]), &message));
        assert!(attributes_match(&attrs(&[("env", "prod")]), &message));
        assert!(!attributes_match(&attrs(&[("env", "dev")]), &message));
        assert!(!attributes_match(&attrs(&[("zone", "x")]), &message));
    }

    #[test]
    fn test_changed_keys_ignores_extra_live_fields() {
        let desired = json!({"name": "t", "labels": {"a": "1"}, "messageRetentionDuration": "600s"});
        let live = json!({"name": "t", "labels": {"a": "1", "b": "2"}, "messageRetentionDuration": "86400s"});
        let changed = changed_keys(desired.as_object().unwrap(), &live, &["name"]);
        assert_eq!(changed, vec!["messageRetentionDuration".to_string()]);

        let same = json!({"labels": {"a": "1"}});
        assert!(changed_keys(same.as_object().unwrap(), &live, &[]).is_empty());
    }

    #[test]
    fn test_update_mask_excludes() {
        let body = json!({"name": "n", "topic": "t", "ackDeadlineSeconds": 10, "labels": {}});
        assert_eq!(
            update_mask(body.as_object().unwrap(), &["name", "topic"]),
            "ackDeadlineSeconds,labels"
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(app_resource_name("app", "job"), "app-job");
        assert_eq!(hyphenate("my_func"), "my-func");
        assert_eq!(short_name("projects/p/topics/t"), "t");
    }
}
