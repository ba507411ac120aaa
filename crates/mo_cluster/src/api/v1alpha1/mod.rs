use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod bucketclaim;
pub mod cloneset;
pub mod cnclaim;
pub mod cnpool;
pub mod cnset;
pub mod common;
pub mod logset;

pub use bucketclaim::{BucketBinding, BucketClaim, BucketClaimSpec, BucketClaimStatus, BucketState};
pub use cloneset::{CloneSet, CloneSetSpec, CloneSetStatus};
pub use cnclaim::{CNClaim, CNClaimPhase, CNClaimSpec, CNClaimStatus, CNStoreStatus, MigrateStatus, SourcePod, Workload};
pub use cnpool::{CNPool, CNPoolSpec, CNPoolStatus, PoolScaleStrategy, PoolStrategy};
pub use cnset::{CNSet, CNSetSpec, CNSetStatus, ScalingConfig};
pub use common::*;
pub use logset::{InitialConfig, LogSet, LogSetDiscovery, LogSetSpec, LogSetStatus, LogStore, StorePhase};

pub const GROUP: &str = "core.matrixorigin.io";
pub const VERSION: &str = "v1alpha1";

/// Prefix of every operator-owned finalizer, `${prefix}/${controller}`.
pub const FINALIZER_PREFIX: &str = "matrixorigin.io";

// Labels shared by every generated object
pub const COMPONENT_LABEL: &str = "matrixorigin.io/component";
pub const INSTANCE_LABEL: &str = "matrixorigin.io/instance";
pub const CLUSTER_LABEL: &str = "matrixorigin.io/cluster";

// CN pod state machine
pub const CN_POD_PHASE_LABEL: &str = "pool.matrixorigin.io/phase";
pub const CLAIMED_BY_LABEL: &str = "pool.matrixorigin.io/claimed-by";
pub const POOL_NAME_LABEL: &str = "pool.matrixorigin.io/pool-name";
pub const OWNER_NAME_LABEL: &str = "pool.matrixorigin.io/owner-name";
pub const LIFECYCLE_STATE_LABEL: &str = "lifecycle.apps.kruise.io/state";

pub const CN_STORE_READINESS: &str = "matrixorigin.io/cn-store";
pub const CN_DRAINING_FINALIZER: &str = "matrixorigin.io/cn-draining";

pub const STORE_DRAINING_START_ANNO: &str = "matrixorigin.io/store-draining-start";
pub const STORE_SCORE_ANNO: &str = "matrixorigin.io/store-score";
pub const DELETION_COST_ANNO: &str = "controller.kubernetes.io/pod-deletion-cost";
pub const CN_STATE_ANNO: &str = "matrixorigin.io/cn-state";
pub const DIAGNOSIS_DRAINING_ANNO: &str = "matrixorigin.io/diagnos-draining";
pub const LOCK_RESTART_SET_ANNO: &str = "matrixorigin.io/lock-restart-set";
pub const BOOTSTRAP_ANNO: &str = "matrixorigin.io/bootstrap";

/// Component label values
pub const LOGSET_COMPONENT: &str = "LogSet";
pub const CNSET_COMPONENT: &str = "CNSet";

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .expect("valid conditions schema")
}

/// Lifecycle state Kruise (or the claim controller) writes on a CN pod
#[derive(Default, Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum LifecycleState {
    #[default]
    Normal,
    PreparingUpdate,
    PreparingDelete,
    Updating,
    Updated,
}

impl LifecycleState {
    pub fn parse(s: &str) -> Self {
        match s {
            "PreparingUpdate" => LifecycleState::PreparingUpdate,
            "PreparingDelete" => LifecycleState::PreparingDelete,
            "Updating" => LifecycleState::Updating,
            "Updated" => LifecycleState::Updated,
            _ => LifecycleState::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Normal => "Normal",
            LifecycleState::PreparingUpdate => "PreparingUpdate",
            LifecycleState::PreparingDelete => "PreparingDelete",
            LifecycleState::Updating => "Updating",
            LifecycleState::Updated => "Updated",
        }
    }

    pub fn is_preparing(&self) -> bool {
        matches!(self, LifecycleState::PreparingUpdate | LifecycleState::PreparingDelete)
    }
}
