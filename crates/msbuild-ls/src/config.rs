//
// config.rs
//
// Settings passed by the editor as initialization options
//

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// File name of the persisted task-assembly metadata cache.
pub const METADATA_CACHE_FILE: &str = "task-metadata.json";

/// Which policy checks run after every parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    /// Root element must be `<Project>`.
    pub root_element: bool,
    pub duplicate_attributes: bool,
    /// `Condition=""` is almost always a mistake.
    pub empty_conditions: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            root_element: true,
            duplicate_attributes: true,
            empty_conditions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub evaluation_timeout_ms: u64,
    pub package_source_timeout_ms: u64,
    /// Global properties handed to the evaluator.
    pub global_properties: BTreeMap<String, String>,
    pub metadata_cache_path: Option<PathBuf>,
    /// Local folder feeds used for package name/version suggestions.
    pub package_feeds: Vec<PathBuf>,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evaluation_timeout_ms: 30_000,
            package_source_timeout_ms: 5_000,
            global_properties: BTreeMap::new(),
            metadata_cache_path: None,
            package_feeds: Vec::new(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Config {
    /// Build from initialization options. Absent fields keep their defaults;
    /// `null` means "no options".
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn package_source_timeout(&self) -> Duration {
        Duration::from_millis(self.package_source_timeout_ms)
    }

    /// Where the metadata cache is persisted: the configured path, else the
    /// user cache directory.
    pub fn resolved_metadata_cache_path(&self) -> PathBuf {
        self.metadata_cache_path
            .clone()
            .unwrap_or_else(default_cache_path)
    }
}

#[cfg(unix)]
fn default_cache_path() -> PathBuf {
    match xdg::BaseDirectories::with_prefix("msbuild-ls") {
        Ok(dirs) => dirs.get_cache_home().join(METADATA_CACHE_FILE),
        Err(err) => {
            log::warn!("No XDG cache directory ({}); using the temp directory", err);
            std::env::temp_dir().join("msbuild-ls").join(METADATA_CACHE_FILE)
        }
    }
}

#[cfg(not(unix))]
fn default_cache_path() -> PathBuf {
    std::env::temp_dir().join("msbuild-ls").join(METADATA_CACHE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(serde_json::Value::Null).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.evaluation_timeout(), Duration::from_secs(30));
        assert_eq!(config.package_source_timeout(), Duration::from_secs(5));
        assert!(config.diagnostics.empty_conditions);
        assert!(config
            .resolved_metadata_cache_path()
            .ends_with(METADATA_CACHE_FILE));
    }

    #[test]
    fn test_partial_options() {
        let config = Config::from_json(json!({
            "evaluationTimeoutMs": 100,
            "globalProperties": { "Configuration": "Release" },
            "metadataCachePath": "/var/cache/ls.json",
            "diagnostics": { "emptyConditions": false },
            "somethingNew": true
        }))
        .unwrap();
        assert_eq!(config.evaluation_timeout_ms, 100);
        assert_eq!(config.package_source_timeout_ms, 5_000);
        assert_eq!(config.global_properties["Configuration"], "Release");
        assert_eq!(
            config.resolved_metadata_cache_path(),
            PathBuf::from("/var/cache/ls.json")
        );
        assert!(!config.diagnostics.empty_conditions);
        assert!(config.diagnostics.root_element);
    }

    #[test]
    fn test_ill_typed_options_are_rejected() {
        assert!(Config::from_json(json!({ "evaluationTimeoutMs": "soon" })).is_err());
    }
}
