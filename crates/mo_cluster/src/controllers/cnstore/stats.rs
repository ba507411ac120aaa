//! Live workload of a CN store as reported by its query service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::{DELETION_COST_ANNO, STORE_SCORE_ANNO};
use crate::hakeeper::{QueryClient, RpcError, Session, SessionCounting};
use crate::util::version::{Capability, ImageVersion};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreScore {
    pub session_count: i64,
    pub pipeline_count: i64,
    pub replica_count: i64,
    /// When the store first reported this workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_time: Option<DateTime<Utc>>,
}

impl StoreScore {
    /// Nothing left on the store that a drain would interrupt
    pub fn is_zero(&self) -> bool {
        self.session_count == 0 && self.pipeline_count == 0 && self.replica_count == 0
    }

    pub fn total(&self) -> i64 {
        self.session_count
            .saturating_add(self.pipeline_count)
            .saturating_add(self.replica_count)
    }

    pub fn same_workload(&self, other: &StoreScore) -> bool {
        self.session_count == other.session_count
            && self.pipeline_count == other.pipeline_count
            && self.replica_count == other.replica_count
    }

    /// Stamps a fresh measurement, keeping the recorded start while the workload is unchanged
    pub fn since(mut self, recorded: Option<&StoreScore>, now: DateTime<Utc>) -> StoreScore {
        self.started_time = match recorded {
            Some(r) if r.same_workload(&self) => r.started_time.or(Some(now)),
            _ => Some(now),
        };
        self
    }

    /// Busier pods cost more to delete, so scale-down picks quiet ones first
    pub fn deletion_cost(&self) -> i32 {
        self.total().clamp(0, i32::MAX as i64) as i32
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                STORE_SCORE_ANNO.to_string(),
                serde_json::to_string(self).unwrap_or_default(),
            ),
            (DELETION_COST_ANNO.to_string(), self.deletion_cost().to_string()),
        ])
    }

    /// The score last recorded on the pod
    pub fn recorded(pod: &Pod) -> Option<StoreScore> {
        pod.annotations()
            .get(STORE_SCORE_ANNO)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Sessions opened by the proxy carry a source label on newer versions; older
/// versions only tell system sessions apart by account
pub fn session_counting(version: &ImageVersion) -> SessionCounting {
    if version.supports(Capability::SessionSource) {
        SessionCounting::ProxySource
    } else {
        SessionCounting::NonSysAccount
    }
}

/// Queries the store's workload; counters the version cannot report are zero
pub async fn collect(
    query: &dyn QueryClient,
    address: &str,
    version: &ImageVersion,
) -> Result<(StoreScore, Vec<Session>), RpcError> {
    let sessions = query.show_process_list(address).await?;
    let pipeline_count = if version.supports(Capability::PipelineInfo) {
        query.get_pipeline_info(address).await?
    } else {
        0
    };
    let replica_count = if version.supports(Capability::ShardingMigration) {
        query.get_replica_count(address).await?
    } else {
        0
    };
    let score = StoreScore {
        session_count: session_counting(version).count(&sessions),
        pipeline_count,
        replica_count,
        started_time: None,
    };
    Ok((score, sessions))
}
