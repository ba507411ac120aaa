use core::fmt;
use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::S3Provider;
use super::conditions_schema;

/// Label carrying the hash of the claimed S3 path, used to find claims of the same path cluster-wide
pub const BUCKET_PATH_HASH_LABEL: &str = "matrixorigin.io/bucket-path-hash";

pub const RECYCLABLE_CONDITION: &str = "Recyclable";

/// Exclusive lease of an S3 path by one LogSet
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(kind = "BucketClaim", group = "core.matrixorigin.io", version = "v1alpha1", namespaced)]
#[kube(status = "BucketClaimStatus", shortname = "bucket")]
#[kube(printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.s3.path"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimSpec {
    pub s3: S3Provider,
}

#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BucketState {
    #[default]
    InUse,
    Released,
}

impl Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BucketState::InUse => write!(f, "InUse"),
            BucketState::Released => write!(f, "Released"),
        }
    }
}

/// Identity of the LogSet a bucket is bound to
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketBinding {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Display for BucketBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}#{}", self.namespace, self.name, self.uid)
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketClaimStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_to: Option<BucketBinding>,
    #[serde(default)]
    pub state: BucketState,
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
}

impl BucketClaim {
    pub fn binding(&self) -> Option<&BucketBinding> {
        self.status.as_ref().and_then(|s| s.bind_to.as_ref())
    }

    pub fn is_bound_to(&self, binding: &BucketBinding) -> bool {
        self.binding() == Some(binding)
    }
}
