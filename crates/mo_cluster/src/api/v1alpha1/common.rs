use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of a CN pod as recorded in its phase label
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum CNPodPhase {
    #[default]
    Unknown,
    Idle,
    Bound,
    Draining,
    Terminating,
}

impl CNPodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Idle" => CNPodPhase::Idle,
            "Bound" => CNPodPhase::Bound,
            "Draining" => CNPodPhase::Draining,
            "Terminating" => CNPodPhase::Terminating,
            _ => CNPodPhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CNPodPhase::Unknown => "Unknown",
            CNPodPhase::Idle => "Idle",
            CNPodPhase::Bound => "Bound",
            CNPodPhase::Draining => "Draining",
            CNPodPhase::Terminating => "Terminating",
        }
    }
}

impl Display for CNPodPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to an external resource once its owner is gone
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RetentionPolicy {
    #[default]
    Retain,
    Delete,
}

impl Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetentionPolicy::Retain => write!(f, "Retain"),
            RetentionPolicy::Delete => write!(f, "Delete"),
        }
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum S3ProviderType {
    #[default]
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "minio")]
    Minio,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemProvider {
    /// Path of the shared filesystem mounted into every pod
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Provider {
    /// `<bucket>/<prefix>` of the shared storage
    pub path: String,
    #[serde(default, rename = "type")]
    pub type_: S3ProviderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Secret holding `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_retention_policy: Option<RetentionPolicy>,
}

impl S3Provider {
    pub fn bucket(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    pub fn prefix(&self) -> &str {
        match self.path.split_once('/') {
            Some((_, prefix)) => prefix.trim_matches('/'),
            None => "",
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.s3_retention_policy.unwrap_or_default()
    }
}

/// Exactly one of the providers is expected to be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedStorageProvider {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system: Option<FileSystemProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Provider>,
}

impl SharedStorageProvider {
    pub fn validate(&self) -> Result<(), String> {
        match (&self.file_system, &self.s3) {
            (Some(_), Some(_)) => Err("only one of fileSystem and s3 may be set".to_string()),
            (None, None) => Err("one of fileSystem or s3 must be set".to_string()),
            (None, Some(s3)) if s3.bucket().is_empty() => Err("s3.path must name a bucket".to_string()),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub size: Quantity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Reference to an object in the same namespace unless `namespace` is set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// A tenant label attached to a CN store in HAKeeper
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNLabel {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// HAKeeper encodes store labels as `map<string, list<string>>`
pub fn to_store_labels(labels: &[CNLabel]) -> BTreeMap<String, Vec<String>> {
    labels
        .iter()
        .map(|l| (l.key.clone(), l.values.clone()))
        .collect()
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CNRole {
    #[default]
    TP,
    AP,
}

impl Display for CNRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CNRole::TP => write!(f, "TP"),
            CNRole::AP => write!(f, "AP"),
        }
    }
}

/// Fields shared by every pod set the operator renders
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    pub replicas: i32,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// TOML overlay merged into the generated runtime config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_to_prometheus: Option<bool>,
}

/// Ports exposed by database processes
pub mod ports {
    pub const LOG_SERVICE: i32 = 32000;
    pub const HAKEEPER: i32 = 32001;
    pub const LOG_RAFT: i32 = 32002;
    pub const LOG_GOSSIP: i32 = 32003;

    pub const CN_SQL: i32 = 6001;
    pub const CN_SERVICE: i32 = 6002;
    pub const CN_PIPELINE: i32 = 6003;
    pub const CN_LOCK_SERVICE: i32 = 6004;
    pub const CN_QUERY: i32 = 6005;
    pub const METRICS: i32 = 7001;
}
