use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{CNLabel, CNRole, ObjectRef, PodSet, Volume};
use super::conditions_schema;
use crate::util::duration::parse_duration;

pub const DEFAULT_STORE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(15);

/// A set of interchangeable compute pods
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "CNSet", group = "core.matrixorigin.io", version = "v1alpha1", namespaced)]
#[kube(status = "CNSetStatus", shortname = "cn")]
#[kube(printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CNSetSpec {
    #[serde(flatten)]
    pub pod_set: PodSet,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<CNRole>,

    /// Local disk cache; an emptyDir is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_volume: Option<Volume>,

    /// `ClusterIP` (default), `NodePort` or `LoadBalancer`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    #[serde(default)]
    pub scaling_config: ScalingConfig,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Pods to remove first on the next scale-in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods_to_delete: Vec<String>,

    #[serde(default)]
    pub pause_update: bool,

    /// Store labels applied to every pod of a non-pooled set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cn_labels: Vec<CNLabel>,

    pub logset_ref: ObjectRef,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dn_set_ref: Option<ObjectRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_drain_enabled: Option<bool>,
    /// e.g. `30m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_drain_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_delay_seconds: Option<i32>,
}

impl ScalingConfig {
    pub fn drain_enabled(&self) -> bool {
        self.store_drain_enabled.unwrap_or(false)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.store_drain_timeout
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .unwrap_or(DEFAULT_STORE_DRAIN_TIMEOUT)
    }

    pub fn min_delay(&self) -> Duration {
        match self.min_delay_seconds {
            Some(s) if s >= 0 => Duration::from_secs(s as u64),
            _ => DEFAULT_MIN_DELAY,
        }
    }
}

impl CNSetSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.pod_set.replicas < 0 {
            return Err("replicas must not be negative".to_string());
        }
        if self.pod_set.image.is_empty() {
            return Err("image must be set".to_string());
        }
        if let Some(timeout) = &self.scaling_config.store_drain_timeout {
            parse_duration(timeout).map_err(|e| format!("scalingConfig.storeDrainTimeout: {e}"))?;
        }
        match (self.service_type.as_deref(), self.node_port) {
            (None | Some("ClusterIP"), Some(_)) => {
                Err("nodePort requires serviceType NodePort or LoadBalancer".to_string())
            }
            (Some(t), _) if !matches!(t, "ClusterIP" | "NodePort" | "LoadBalancer") => {
                Err(format!("unsupported serviceType {t}"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNSetStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
}

impl CNSet {
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

    #[test]
    fn scaling_defaults() {
        let cfg = ScalingConfig::default();
        assert!(!cfg.drain_enabled());
        assert_eq!(cfg.drain_timeout(), DEFAULT_STORE_DRAIN_TIMEOUT);
        assert_eq!(cfg.min_delay(), Duration::from_secs(15));
    }

    #[test]
    fn scaling_overrides() {
        let cfg = ScalingConfig {
            store_drain_enabled: Some(true),
            store_drain_timeout: Some("2m".to_string()),
            min_delay_seconds: Some(0),
        };
        assert!(cfg.drain_enabled());
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.min_delay(), Duration::ZERO);
    }

    #[test]
    fn node_port_needs_exposed_service() {
        let mut spec = CNSetSpec {
            pod_set: PodSet {
                replicas: 1,
                image: "matrixorigin/matrixone:1.2.0".to_string(),
                ..Default::default()
            },
            node_port: Some(31429),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
        spec.service_type = Some("NodePort".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn oversized_drain_timeout_is_rejected() {
        let mut spec = CNSetSpec {
            pod_set: PodSet {
                replicas: 1,
                image: "matrixorigin/matrixone:1.2.0".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        spec.scaling_config.store_drain_timeout = Some("100000000000000000000000h".to_string());
        assert!(spec.validate().is_err());
        assert_eq!(spec.scaling_config.drain_timeout(), DEFAULT_STORE_DRAIN_TIMEOUT);
    }
}
