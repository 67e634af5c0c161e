//! Project configuration (`.goblet/config.json` or `.goblet/config.yaml`).
//!
//! A [`GConfig`] is an immutable JSON object. Stage selection deep-merges
//! `stages.<name>` over the base document; overlays always produce a new
//! value.

use crate::error::{GobletError, GobletResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const GOBLET_DIR: &str = ".goblet";
pub const STAGE_ENV_VAR: &str = "STAGE";

/// `{root}/.goblet`
pub fn goblet_dir(root: &Path) -> PathBuf {
    root.join(GOBLET_DIR)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key,
/// everything else is replaced.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(k) {
                    Some(existing) if existing.is_object() && v.is_object() => deep_merge(existing, v),
                    _ => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Return a merged copy, leaving both inputs untouched.
pub fn merged(base: &Value, overlay: &Value) -> Value {
    let mut out = base.clone();
    deep_merge(&mut out, overlay);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct GConfig {
    values: Value,
    stage: Option<String>,
}

impl Default for GConfig {
    fn default() -> Self {
        Self {
            values: Value::Object(Map::new()),
            stage: None,
        }
    }
}

impl GConfig {
    /// Wrap a raw document without stage handling.
    pub fn new(values: Value) -> Self {
        let values = if values.is_object() {
            values
        } else {
            Value::Object(Map::new())
        };
        Self { values, stage: None }
    }

    /// Validate `values` and apply `stage` (if any).
    pub fn with_stage(values: Value, stage: Option<&str>) -> GobletResult<Self> {
        let base = Self::new(values);
        base.validate(stage)?;
        let Some(stage) = stage else {
            return Ok(base);
        };
        let stage_values = base
            .values
            .get("stages")
            .and_then(|s| s.get(stage))
            .cloned()
            .unwrap_or(Value::Null);
        let mut values = base.values;
        deep_merge(&mut values, &stage_values);
        Ok(Self {
            values,
            stage: Some(stage.to_string()),
        })
    }

    /// Load from `{root}/.goblet/config.json` (or `config.yaml`). A missing
    /// file yields an empty config. `stage` falls back to `$STAGE`.
    pub fn load(root: &Path, stage: Option<&str>) -> GobletResult<Self> {
        let dir = goblet_dir(root);
        let json_path = dir.join("config.json");
        let yaml_path = dir.join("config.yaml");
        let values = if json_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&json_path)?)?
        } else if yaml_path.exists() {
            serde_yaml::from_str(&std::fs::read_to_string(&yaml_path)?)?
        } else {
            Value::Object(Map::new())
        };
        let env_stage = std::env::var(STAGE_ENV_VAR).ok().filter(|s| !s.is_empty());
        let stage = stage.map(str::to_string).or(env_stage);
        Self::with_stage(values, stage.as_deref())
    }

    fn validate(&self, stage: Option<&str>) -> GobletResult<()> {
        let stages = self.values.get("stages").and_then(|s| s.as_object());
        if let Some(stage) = stage {
            if !stages.map(|s| s.contains_key(stage)).unwrap_or(false) {
                return Err(GobletError::validation(format!(
                    "stage {} not found in config",
                    stage
                )));
            }
        }
        for (name, body) in stages.into_iter().flatten() {
            if body.get("function_name").is_none() {
                return Err(GobletError::validation(format!(
                    "function_name key missing for stage {}",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    pub fn as_value(&self) -> &Value {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// Nested lookup, e.g. `["cloudrun", "service-account"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut current = &self.values;
        for key in path {
            current = current.get(*key)?;
        }
        Some(current).filter(|v| !v.is_null())
    }

    /// An object section, or an empty map.
    pub fn section(&self, key: &str) -> Map<String, Value> {
        self.get(key)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    }

    /// A string value; falls back to the environment variable of the same name.
    pub fn str_value(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => std::env::var(key).ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn labels(&self) -> Map<String, Value> {
        self.section("labels")
    }

    pub fn function_name(&self) -> Option<String> {
        self.get("function_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn client_versions(&self) -> HashMap<String, String> {
        self.section("client_versions")
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect()
    }

    /// `bindings` as IAM binding objects.
    pub fn bindings(&self) -> Vec<Value> {
        self.get("bindings")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    /// `{ name: value }` of a section's string-valued entries.
    pub fn string_map(&self, path: &[&str]) -> BTreeMap<String, String> {
        self.get_path(path)
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| match v {
                        Value::String(s) => Some((k.clone(), s.clone())),
                        Value::Null => None,
                        other => Some((k.clone(), other.to_string())),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A new config with `overlay` deep-merged on top.
    pub fn with_overlay(&self, overlay: &Value) -> Self {
        Self {
            values: merged(&self.values, overlay),
            stage: self.stage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_deep_merges() {
        let config = GConfig::with_stage(
            json!({
                "cloudrun": {"max-instances": 1, "memory": "512Mi"},
                "stages": {"prod": {"function_name": "app-prod", "cloudrun": {"max-instances": 5}}}
            }),
            Some("prod"),
        )
        .unwrap();
        assert_eq!(config.stage(), Some("prod"));
        assert_eq!(config.function_name().as_deref(), Some("app-prod"));
        assert_eq!(config.section("cloudrun")["max-instances"], 5);
        assert_eq!(config.section("cloudrun")["memory"], "512Mi");
    }

    #[test]
    fn test_stage_validation() {
        let err = GConfig::with_stage(json!({"stages": {}}), Some("dev")).unwrap_err();
        assert!(err.to_string().contains("stage dev not found"));

        let err = GConfig::with_stage(json!({"stages": {"dev": {}}}), None).unwrap_err();
        assert!(err.to_string().contains("function_name key missing for stage dev"));
    }

    #[test]
    fn test_overlay_does_not_mutate() {
        let base = GConfig::new(json!({"cloudfunction": {"timeout": "60s"}}));
        let overlaid = base.with_overlay(&json!({"cloudfunction": {"vpcConnector": "c"}}));
        assert!(base.get_path(&["cloudfunction", "vpcConnector"]).is_none());
        assert_eq!(overlaid.get_path(&["cloudfunction", "vpcConnector"]).unwrap(), "c");
        assert_eq!(overlaid.get_path(&["cloudfunction", "timeout"]).unwrap(), "60s");
    }

    #[test]
    fn test_load_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(GConfig::load(dir.path(), None).unwrap().as_value(), &json!({}));

        std::fs::create_dir_all(goblet_dir(dir.path())).unwrap();
        std::fs::write(
            goblet_dir(dir.path()).join("config.yaml"),
            "labels:\n  team: data\nclient_versions:\n  run: v2\n",
        )
        .unwrap();
        let config = GConfig::load(dir.path(), None).unwrap();
        assert_eq!(config.labels()["team"], "data");
        assert_eq!(config.client_versions()["run"], "v2");
    }

    #[test]
    fn test_str_value_env_fallback() {
        let config = GConfig::new(json!({"runtime": "python311"}));
        assert_eq!(config.str_value("runtime").as_deref(), Some("python311"));
        assert_eq!(config.str_value("GOBLET_TEST_SURELY_UNSET_KEY"), None);
    }
}
