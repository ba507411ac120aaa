use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cnset::CNSetSpec;
use super::conditions_schema;

/// A warm pool of idle CN pods claimed through `CNClaim`
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "CNPool", group = "core.matrixorigin.io", version = "v1alpha1", namespaced)]
#[kube(status = "CNPoolStatus", shortname = "cnp")]
#[kube(printcolumn = r#"{"name":"Idle","type":"integer","jsonPath":".status.availablePods"}"#)]
#[kube(printcolumn = r#"{"name":"InUse","type":"integer","jsonPath":".status.claimedPods"}"#)]
#[kube(printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.totalPods"}"#)]
#[serde(rename_all = "camelCase")]
pub struct CNPoolSpec {
    /// Template of the pool pods; `replicas` is ignored
    pub template: CNSetSpec,

    /// Labels put on every pool pod, matched by claim selectors
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,

    pub strategy: PoolStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStrategy {
    pub scale_strategy: PoolScaleStrategy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolScaleStrategy {
    pub max_idle: i32,
    /// Upper bound on the total pods of the pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pods: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CNPoolStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub available_pods: i32,
    #[serde(default)]
    pub claimed_pods: i32,
    #[serde(default)]
    pub total_pods: i32,
}
