use core::fmt;
use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::CNLabel;

/// Reservation of one pool pod for a tenant
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CNClaim", group = "core.matrixorigin.io", version = "v1alpha1", namespaced)]
#[kube(status = "CNClaimStatus", shortname = "cnc")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.podName"}"#)]
#[kube(printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolName"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimSpec {
    /// Matches the pod labels of candidate pools
    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_name: Option<String>,

    /// Set by the operator once bound, or by the user to request a migration target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Pod the claim migrates away from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_pod: Option<SourcePod>,

    /// Pods last owned by the same owner are preferred
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cn_labels: Vec<CNLabel>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourcePod {
    pub pod_name: String,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CNClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

impl Display for CNClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CNClaimPhase::Pending => write!(f, "Pending"),
            CNClaimPhase::Bound => write!(f, "Bound"),
            CNClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

/// The HAKeeper view of the bound store
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNStoreStatus {
    pub service_id: String,
    pub pod_name: String,
    #[serde(default)]
    pub sql_address: String,
    #[serde(default)]
    pub query_address: String,
    #[serde(default)]
    pub pipeline_service_address: String,
    #[serde(default)]
    pub lock_service_address: String,
    #[serde(default)]
    pub work_state: String,
    #[serde(default)]
    pub labels: Vec<CNLabel>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub connections: i32,
    pub pipelines: i32,
    pub replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrateStatus {
    pub source: Workload,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNClaimStatus {
    #[serde(default)]
    pub phase: CNClaimPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<CNStoreStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateStatus>,
}

impl CNClaim {
    pub fn phase(&self) -> CNClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
