use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::{
    api::{Api, ListParams},
    client::Client,
    ResourceExt,
};
use prometheus::IntGauge;
use tracing::*;

use super::cache::{StoreCache, REFRESH_INTERVAL};
use super::types::{StoreLabels, WorkState};
use super::{discovery_address, ClientFactory, HaKeeperClient, LockServiceClient, QueryClient, RpcError};
use crate::api::v1alpha1::LogSet;
use crate::util::errors::{Error, Result};

pub const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Long-lived clients of one LogSet's control plane
pub struct ClientSet {
    pub logset_uid: String,
    pub namespace: String,
    pub name: String,
    pub hakeeper: Arc<dyn HaKeeperClient>,
    pub lock_service: Arc<dyn LockServiceClient>,
    pub cache: StoreCache,
}

impl ClientSet {
    fn tn_lock_address(&self) -> Result<String, RpcError> {
        self.cache
            .get_tn_store()
            .map(|tn| tn.lock_service_address)
            .filter(|a| !a.is_empty())
            .ok_or(RpcError::NoTNStore)
    }

    pub async fn patch_cn_store(&self, uuid: &str, state: WorkState, labels: Option<StoreLabels>) -> Result<(), RpcError> {
        self.hakeeper.patch_cn_store(uuid, state, labels).await
    }

    pub async fn set_restart_cn(&self, uuid: &str) -> Result<bool, RpcError> {
        self.lock_service.set_restart_cn(&self.tn_lock_address()?, uuid).await
    }

    pub async fn can_restart_cn(&self, uuid: &str) -> Result<bool, RpcError> {
        self.lock_service.can_restart_cn(&self.tn_lock_address()?, uuid).await
    }

    pub async fn remain_txn_count(&self, uuid: &str) -> Result<i64, RpcError> {
        self.lock_service.remain_txn_count(&self.tn_lock_address()?, uuid).await
    }
}

/// Identity of a cached entry, used to decide garbage collection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryKey {
    pub uid: String,
    pub namespace: String,
    pub name: String,
}

/// Entries whose LogSet is gone, or was replaced by a Ready LogSet of the same name
pub fn stale_entries(entries: &[EntryKey], logsets: &[LogSet]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| {
            if logsets.iter().any(|ls| ls.uid().as_deref() == Some(entry.uid.as_str())) {
                return false;
            }
            match logsets.iter().find(|ls| {
                ls.namespace().as_deref() == Some(entry.namespace.as_str()) && ls.name_any() == entry.name
            }) {
                None => true,
                Some(replacement) => replacement.is_ready(),
            }
        })
        .map(|entry| entry.uid.clone())
        .collect()
}

/// Per-LogSet client cache keyed by LogSet uid
pub struct Manager {
    client: Client,
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<String, Arc<ClientSet>>>,
    gauge: IntGauge,
    query: Arc<dyn QueryClient>,
}

impl Manager {
    pub fn new(client: Client, factory: Arc<dyn ClientFactory>, gauge: IntGauge) -> Self {
        let query = factory.query();
        Manager {
            client,
            factory,
            entries: Mutex::new(HashMap::new()),
            gauge,
            query,
        }
    }

    /// Returns the client set of `logset`, creating it on first use
    pub fn get_client(&self, logset: &LogSet) -> Result<Arc<ClientSet>> {
        let uid = logset
            .uid()
            .ok_or_else(|| Error::metadata_missing("logset uid"))?;
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = entries.get(&uid) {
            return Ok(existing.clone());
        }

        let address = discovery_address(logset);
        info!("creating HAKeeper client for logset {}/{} at {address}", logset.namespace().unwrap_or_default(), logset.name_any());
        let hakeeper = self.factory.hakeeper(&address)?;
        let set = Arc::new(ClientSet {
            logset_uid: uid.clone(),
            namespace: logset.namespace().unwrap_or_default(),
            name: logset.name_any(),
            cache: StoreCache::start(hakeeper.clone(), REFRESH_INTERVAL),
            hakeeper,
            lock_service: self.factory.lock_service(),
        });
        entries.insert(uid, set.clone());
        self.gauge.set(entries.len() as i64);
        Ok(set)
    }

    pub fn query(&self) -> Arc<dyn QueryClient> {
        self.query.clone()
    }

    /// Drops the client set of a LogSet, stopping its cache refresher
    pub fn remove(&self, uid: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.remove(uid).is_some() {
            debug!("dropped HAKeeper client for logset uid {uid}");
        }
        self.gauge.set(entries.len() as i64);
    }

    fn keys(&self) -> Vec<EntryKey> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|set| EntryKey {
                uid: set.logset_uid.clone(),
                namespace: set.namespace.clone(),
                name: set.name.clone(),
            })
            .collect()
    }

    pub async fn gc(&self) -> Result<()> {
        let keys = self.keys();
        if keys.is_empty() {
            return Ok(());
        }
        let logsets = Api::<LogSet>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items;
        for uid in stale_entries(&keys, &logsets) {
            self.remove(&uid);
        }
        Ok(())
    }

    /// Runs [`Manager::gc`] forever
    pub async fn run_gc(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.gc().await {
                warn!("HAKeeper client gc failed: {e}");
            }
        }
    }
}
