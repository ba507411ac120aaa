//! Operator configuration mounted as a directory, one YAML document per key,
//! and the TOML runtime config rendered for database processes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::*;

use crate::util::errors::{Error, Result, StdError};

pub const FEATURE_GATES_KEY: &str = "featureGates";
pub const DEFAULT_ARGS_KEY: &str = "defaultArgs";
pub const BUCKET_CLEAN_JOB_KEY: &str = "bucketCleanJob";
pub const BR_CONFIG_KEY: &str = "brConfig";

pub const DEFAULT_BUCKET_CLEAN_IMAGE: &str = "amazon/aws-cli:2.15.0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureGates {
    /// BucketClaim lifecycle for S3-backed LogSets
    pub s3_reclaim: bool,
    /// CNPool and CNClaim controllers
    pub cn_pool: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        FeatureGates {
            s3_reclaim: true,
            cn_pool: true,
        }
    }
}

/// Extra process arguments appended per component
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultArgs {
    pub log_service: Vec<String>,
    pub cn: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketCleanJob {
    pub image: String,
    pub pull_secrets: Vec<String>,
}

impl Default for BucketCleanJob {
    fn default() -> Self {
        BucketCleanJob {
            image: DEFAULT_BUCKET_CLEAN_IMAGE.to_string(),
            pull_secrets: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrConfig {
    pub image: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub feature_gates: FeatureGates,
    pub default_args: DefaultArgs,
    pub bucket_clean_job: BucketCleanJob,
    pub br_config: BrConfig,
    /// Evict log stores that stay down past their failure timeout
    #[serde(skip)]
    pub failover: bool,
}

impl OperatorConfig {
    /// Reads every known key file under `dir`; absent files keep their defaults
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(OperatorConfig {
            feature_gates: read_key(dir, FEATURE_GATES_KEY)?.unwrap_or_default(),
            default_args: read_key(dir, DEFAULT_ARGS_KEY)?.unwrap_or_default(),
            bucket_clean_job: read_key(dir, BUCKET_CLEAN_JOB_KEY)?.unwrap_or_default(),
            br_config: read_key(dir, BR_CONFIG_KEY)?.unwrap_or_default(),
            failover: false,
        })
    }
}

fn read_key<T: DeserializeOwned>(dir: &Path, key: &str) -> Result<Option<T>> {
    let path = dir.join(key);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("operator config {} not present, using defaults", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(Error::StdError(StdError::ConfigError(format!(
                "read {}: {e}",
                path.display()
            ))))
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::StdError(StdError::ConfigError(format!("parse {key}: {e}"))))
}

/// Merges the user's TOML overlay into the operator generated config.
///
/// Tables merge recursively; operator keys in `forced` always win, other keys
/// in the overlay replace the generated defaults.
pub fn render_toml(defaults: toml::Table, overlay: Option<&str>, forced: toml::Table) -> Result<String> {
    let mut merged = defaults;
    if let Some(overlay) = overlay.filter(|s| !s.trim().is_empty()) {
        let user: toml::Table = overlay
            .parse()
            .map_err(|e| Error::invalid_spec(format!("config is not valid TOML: {e}")))?;
        merge_table(&mut merged, user);
    }
    merge_table(&mut merged, forced);
    toml::to_string(&merged).map_err(|e| Error::StdError(StdError::SerializationError(e.to_string())))
}

fn merge_table(base: &mut toml::Table, overlay: toml::Table) {
    for (k, v) in overlay {
        match (base.get_mut(&k), v) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => merge_table(b, o),
            (_, v) => {
                base.insert(k, v);
            }
        }
    }
}

/// Builds a nested table from dotted keys, e.g. `fileservice.s3.bucket`
pub fn dotted_table(entries: BTreeMap<&str, toml::Value>) -> toml::Table {
    let mut root = toml::Table::new();
    for (key, value) in entries {
        let mut parts: Vec<&str> = key.split('.').collect();
        let leaf = parts.pop().unwrap_or(key);
        let mut current = &mut root;
        for part in parts {
            let next = current
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            if !next.is_table() {
                *next = toml::Value::Table(toml::Table::new());
            }
            let toml::Value::Table(t) = next else { unreachable!() };
            current = t;
        }
        current.insert(leaf.to_string(), value);
    }
    root
}
