use core::fmt;
use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{PodSet, RetentionPolicy, SharedStorageProvider, Volume};
use super::conditions_schema;

/// An ordered, quorum-sized ensemble of log service replicas with HAKeeper embedded
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "LogSet", group = "core.matrixorigin.io", version = "v1alpha1", namespaced)]
#[kube(status = "LogSetStatus", shortname = "log")]
#[kube(printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct LogSetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    pub volume: Volume,

    pub shared_storage: SharedStorageProvider,

    #[serde(default)]
    pub initial_config: InitialConfig,

    /// How long a store may stay Down before it is evicted, e.g. `10m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_failure_timeout: Option<String>,

    /// Whether eviction also deletes the store's volume claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc_retention_policy: Option<RetentionPolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_shards: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dn_shards: Option<i32>,
    /// Intended HA size of every log shard
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_shard_replicas: Option<i32>,
}

pub const DEFAULT_STORE_FAILURE_TIMEOUT: &str = "10m";

impl LogSetSpec {
    /// Replica count HAKeeper is bootstrapped with
    pub fn ha_size(&self) -> i32 {
        match self.initial_config.log_shard_replicas {
            Some(n) => n,
            None if self.pod_set.replicas < 3 => 1,
            None => 3,
        }
    }

    /// Number of Up stores required for the ensemble to serve
    pub fn quorum(&self) -> i32 {
        let ha = self.ha_size();
        if ha <= 1 {
            1
        } else {
            ha / 2 + 1
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pod_set.replicas < 1 {
            return Err("replicas must be at least 1".to_string());
        }
        if self.pod_set.image.is_empty() {
            return Err("image must be set".to_string());
        }
        if self.pod_set.replicas < self.ha_size() {
            return Err(format!(
                "replicas {} is less than initialConfig.logShardReplicas {}",
                self.pod_set.replicas,
                self.ha_size()
            ));
        }
        self.shared_storage.validate()
    }
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum StorePhase {
    Up,
    #[default]
    Down,
}

impl Display for StorePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorePhase::Up => write!(f, "Up"),
            StorePhase::Down => write!(f, "Down"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogStore {
    pub pod_name: String,
    pub uuid: String,
    pub phase: StorePhase,
    pub last_transition_time: Time,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSetDiscovery {
    pub address: String,
    pub port: i32,
}

impl LogSetDiscovery {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The status object of `LogSet`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSetStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub stores: Vec<LogStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<LogSetDiscovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_claim: Option<String>,
}

impl LogSet {
    pub fn discovery_service_name(&self) -> String {
        format!("{}-discovery", self.metadata.name.clone().unwrap_or_default())
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.metadata.name.clone().unwrap_or_default())
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| crate::util::status::is_status_condition_true(&s.conditions, "Ready"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: i32, ha: Option<i32>) -> LogSetSpec {
        LogSetSpec {
            pod_set: PodSet {
                replicas,
                image: "matrixorigin/matrixone:1.2.0".to_string(),
                ..Default::default()
            },
            initial_config: InitialConfig {
                log_shard_replicas: ha,
                ..Default::default()
            },
            shared_storage: SharedStorageProvider {
                file_system: Some(super::super::common::FileSystemProvider {
                    path: "/test".to_string(),
                }),
                s3: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn single_replica_has_quorum_of_one() {
        let s = spec(1, None);
        assert_eq!(s.ha_size(), 1);
        assert_eq!(s.quorum(), 1);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn ha_quorum_is_majority() {
        assert_eq!(spec(3, None).quorum(), 2);
        assert_eq!(spec(5, Some(5)).quorum(), 3);
    }

    #[test]
    fn replicas_below_ha_size_is_invalid() {
        assert!(spec(2, Some(3)).validate().is_err());
    }
}
