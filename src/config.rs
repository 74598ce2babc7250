use std::fs;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::DepotError;

pub const CONFIG_FILE_NAME: &str = "dcor-depot.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub depot_root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub check: CheckSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub object_store: ObjectStoreSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ArchiveSection {
    #[serde(default)]
    pub processed: Option<Utf8PathBuf>,
    #[serde(default)]
    pub archived_meta: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CheckSection {
    #[serde(default)]
    pub min_events: Option<usize>,
    #[serde(default)]
    pub count_tolerance_min: Option<i64>,
    #[serde(default)]
    pub count_tolerance_max: Option<i64>,
    #[serde(default)]
    pub small_count_mismatch: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ToolsSection {
    #[serde(default)]
    pub inspect: Option<String>,
    #[serde(default)]
    pub compress: Option<String>,
    #[serde(default)]
    pub condense: Option<String>,
    #[serde(default)]
    pub tdms2rtdc: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default)]
    pub resources: Option<Utf8PathBuf>,
    #[serde(default)]
    pub user_depot: Option<Utf8PathBuf>,
    #[serde(default)]
    pub catalog: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ObjectStoreSection {
    #[serde(default)]
    pub root: Option<Utf8PathBuf>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub bucket_prefix: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Rules the validity checker applies on top of the format oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckPolicy {
    pub min_events: usize,
    pub count_tolerance_min: i64,
    /// `None` means no upper bound.
    pub count_tolerance_max: Option<i64>,
    pub small_count_mismatch: i64,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            min_events: 50,
            count_tolerance_min: -10,
            count_tolerance_max: None,
            small_count_mismatch: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivePaths {
    pub processed: Utf8PathBuf,
    pub archived_meta: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolPaths {
    pub inspect: String,
    pub compress: String,
    pub condense: String,
    pub tdms2rtdc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoragePaths {
    pub resources: Utf8PathBuf,
    pub user_depot: Utf8PathBuf,
    pub catalog: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ObjectStoreBackend {
    Filesystem(Utf8PathBuf),
    Http(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectStoreSettings {
    pub backend: ObjectStoreBackend,
    pub bucket_prefix: String,
    pub token_env: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub depot_root: Utf8PathBuf,
    pub archive: ArchivePaths,
    pub check: CheckPolicy,
    pub tools: ToolPaths,
    pub storage: StoragePaths,
    pub object_store: ObjectStoreSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path first, then `./dcor-depot.json`, then the user config
    /// directory; built-in defaults when none exists.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DepotError> {
        let config_path = match path {
            Some(path) => Some(Utf8PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            tracing::debug!("no config file found, using defaults");
            return Self::resolve_config(Config::default());
        };

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| DepotError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DepotError::ConfigParse(err.to_string()))?;
        tracing::debug!(path = %config_path, "loaded config");

        Self::resolve_config(config)
    }

    fn discover() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE_NAME);
        if local.as_std_path().exists() {
            return Some(local);
        }
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.config_dir().join("dcor-depot").join("config.json"))
                    .ok()
            })
            .filter(|path| path.as_std_path().exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DepotError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(DepotError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let defaults = CheckPolicy::default();
        let check = CheckPolicy {
            min_events: config.check.min_events.unwrap_or(defaults.min_events),
            count_tolerance_min: config
                .check
                .count_tolerance_min
                .unwrap_or(defaults.count_tolerance_min),
            count_tolerance_max: config.check.count_tolerance_max,
            small_count_mismatch: config
                .check
                .small_count_mismatch
                .unwrap_or(defaults.small_count_mismatch),
        };
        if let Some(max) = check.count_tolerance_max {
            if max < check.count_tolerance_min {
                return Err(DepotError::ConfigParse(
                    "check.count_tolerance_max is below check.count_tolerance_min".to_string(),
                ));
            }
        }

        let backend = match (config.object_store.endpoint_url, config.object_store.root) {
            (Some(_), Some(_)) => {
                return Err(DepotError::ConfigParse(
                    "object_store.root and object_store.endpoint_url are mutually exclusive"
                        .to_string(),
                ));
            }
            (Some(url), None) => ObjectStoreBackend::Http(url.trim_end_matches('/').to_string()),
            (None, Some(root)) => ObjectStoreBackend::Filesystem(root),
            (None, None) => ObjectStoreBackend::Filesystem(Utf8PathBuf::from("/data/object-store")),
        };

        Ok(ResolvedConfig {
            schema_version,
            depot_root: config
                .depot_root
                .unwrap_or_else(|| Utf8PathBuf::from("/data/depots/internal")),
            archive: ArchivePaths {
                processed: config
                    .archive
                    .processed
                    .unwrap_or_else(|| Utf8PathBuf::from("/data/archive/processed")),
                archived_meta: config
                    .archive
                    .archived_meta
                    .unwrap_or_else(|| Utf8PathBuf::from("/data/archive/archived_meta")),
            },
            check,
            tools: ToolPaths {
                inspect: config.tools.inspect.unwrap_or_else(|| "rtdc-inspect".to_string()),
                compress: config
                    .tools
                    .compress
                    .unwrap_or_else(|| "dclab-compress".to_string()),
                condense: config
                    .tools
                    .condense
                    .unwrap_or_else(|| "dclab-condense".to_string()),
                tdms2rtdc: config
                    .tools
                    .tdms2rtdc
                    .unwrap_or_else(|| "dclab-tdms2rtdc".to_string()),
            },
            storage: StoragePaths {
                resources: config
                    .storage
                    .resources
                    .unwrap_or_else(|| Utf8PathBuf::from("/data/ckan-storage/resources")),
                user_depot: config
                    .storage
                    .user_depot
                    .unwrap_or_else(|| Utf8PathBuf::from("/data/depots/users-dcor")),
                catalog: config
                    .storage
                    .catalog
                    .unwrap_or_else(|| Utf8PathBuf::from("/data/depots/catalog.json")),
            },
            object_store: ObjectStoreSettings {
                backend,
                bucket_prefix: config
                    .object_store
                    .bucket_prefix
                    .unwrap_or_else(|| "circle-".to_string()),
                token_env: config
                    .object_store
                    .token_env
                    .unwrap_or_else(|| "DCOR_OBJECT_STORE_TOKEN".to_string()),
                timeout_secs: config.object_store.timeout_secs.unwrap_or(60),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_depot_conventions() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.depot_root, "/data/depots/internal");
        assert_eq!(resolved.check, CheckPolicy::default());
        assert_eq!(resolved.check.count_tolerance_min, -10);
        assert_eq!(resolved.check.count_tolerance_max, None);
        assert_eq!(resolved.tools.condense, "dclab-condense");
    }

    #[test]
    fn rejects_both_object_store_backends() {
        let mut config = Config::default();
        config.object_store.root = Some(Utf8PathBuf::from("/tmp/store"));
        config.object_store.endpoint_url = Some("http://localhost:9000".to_string());
        assert!(ConfigLoader::resolve_config(config).is_err());
    }
}
