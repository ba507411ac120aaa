use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::*;

use super::types::{ClusterDetails, StoreLabels, TNStore, WorkState};
use super::HaKeeperClient;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15);
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached HAKeeper view of a CN store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CNStoreInfo {
    pub service_id: String,
    pub pipeline_service_address: String,
    pub sql_address: String,
    pub lock_service_address: String,
    pub query_address: String,
    pub work_state: WorkState,
    pub labels: StoreLabels,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub cn_stores: HashMap<String, CNStoreInfo>,
    pub tn_store: Option<TNStore>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl From<ClusterDetails> for Snapshot {
    fn from(details: ClusterDetails) -> Self {
        let cn_stores = details
            .cn_stores
            .into_iter()
            .map(|s| {
                let info = CNStoreInfo {
                    service_id: s.uuid.clone(),
                    pipeline_service_address: s.service_address,
                    sql_address: s.sql_address,
                    lock_service_address: s.lock_service_address,
                    query_address: s.query_address,
                    work_state: s.work_state,
                    labels: s.labels,
                };
                (s.uuid, info)
            })
            .collect();
        Snapshot {
            cn_stores,
            tn_store: details.tn_stores.into_iter().next(),
            refreshed_at: Some(Utc::now()),
        }
    }
}

/// Periodically refreshed, read-only snapshot of the cluster topology.
///
/// A failed refresh keeps the previous snapshot. The refresher stops when the cache is dropped.
pub struct StoreCache {
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    refresher: Option<JoinHandle<()>>,
}

impl StoreCache {
    /// Starts refreshing in the background; the first refresh runs immediately
    pub fn start(client: Arc<dyn HaKeeperClient>, interval: Duration) -> Self {
        let snapshot = Arc::new(RwLock::new(Arc::new(Snapshot::default())));
        let target = snapshot.clone();
        let refresher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                refresh(client.as_ref(), &target).await;
            }
        });
        StoreCache {
            snapshot,
            refresher: Some(refresher),
        }
    }

    /// A cache that is only filled through [`StoreCache::refresh_with`]
    pub fn detached() -> Self {
        StoreCache {
            snapshot: Arc::new(RwLock::new(Arc::new(Snapshot::default()))),
            refresher: None,
        }
    }

    pub async fn refresh_with(&self, client: &dyn HaKeeperClient) -> bool {
        refresh(client, &self.snapshot).await
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get_cn_store(&self, uuid: &str) -> Option<CNStoreInfo> {
        self.snapshot().cn_stores.get(uuid).cloned()
    }

    pub fn get_tn_store(&self) -> Option<TNStore> {
        self.snapshot().tn_store.clone()
    }
}

impl Drop for StoreCache {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.take() {
            handle.abort();
        }
    }
}

async fn refresh(client: &dyn HaKeeperClient, target: &RwLock<Arc<Snapshot>>) -> bool {
    match tokio::time::timeout(REFRESH_TIMEOUT, client.get_cluster_details()).await {
        Ok(Ok(details)) => {
            let snapshot = Arc::new(Snapshot::from(details));
            *target.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
            true
        }
        Ok(Err(e)) => {
            warn!("failed to refresh store cache, keeping previous snapshot: {e}");
            false
        }
        Err(_) => {
            warn!("store cache refresh timed out after {REFRESH_TIMEOUT:?}");
            false
        }
    }
}
