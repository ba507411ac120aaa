//! In-memory control plane used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::types::*;
use super::{ClientFactory, HaKeeperClient, LockServiceClient, QueryClient, RpcError};

#[derive(Default)]
struct HaKeeperState {
    cn_stores: HashMap<String, CNStore>,
    tn: Option<TNStore>,
    fail_next_details: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHaKeeper {
    state: Mutex<HaKeeperState>,
}

impl FakeHaKeeper {
    pub fn register(&self, store: CNStore) {
        self.state.lock().unwrap().cn_stores.insert(store.uuid.clone(), store);
    }

    pub fn set_tn(&self, tn: TNStore) {
        self.state.lock().unwrap().tn = Some(tn);
    }

    pub fn fail_next_details(&self) {
        self.state.lock().unwrap().fail_next_details = true;
    }

    pub fn store(&self, uuid: &str) -> Option<CNStore> {
        self.state.lock().unwrap().cn_stores.get(uuid).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl HaKeeperClient for FakeHaKeeper {
    async fn get_cluster_details(&self) -> Result<ClusterDetails, RpcError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_details) {
            return Err(RpcError::Http("connection refused".to_string()));
        }
        Ok(ClusterDetails {
            cn_stores: state.cn_stores.values().cloned().collect(),
            tn_stores: state.tn.iter().cloned().collect(),
            log_stores: Vec::new(),
        })
    }

    async fn patch_cn_store(&self, uuid: &str, work_state: WorkState, labels: Option<StoreLabels>) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("patch {uuid} {work_state}"));
        let store = state
            .cn_stores
            .get_mut(uuid)
            .ok_or_else(|| RpcError::StoreNotExist(uuid.to_string()))?;
        store.work_state = work_state;
        if let Some(labels) = labels {
            store.labels = labels;
        }
        Ok(())
    }

    async fn update_cn_label(&self, uuid: &str, labels: StoreLabels) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("label {uuid}"));
        let store = state
            .cn_stores
            .get_mut(uuid)
            .ok_or_else(|| RpcError::StoreNotExist(uuid.to_string()))?;
        store.labels = labels;
        Ok(())
    }

    async fn delete_cn_store(&self, uuid: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {uuid}"));
        state
            .cn_stores
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| RpcError::StoreNotExist(uuid.to_string()))
    }
}

#[derive(Default)]
pub struct FakeLockService {
    restartable: Mutex<HashSet<String>>,
    restart_set: Mutex<Vec<String>>,
}

impl FakeLockService {
    pub fn allow_restart(&self, uuid: &str) {
        self.restartable.lock().unwrap().insert(uuid.to_string());
    }

    pub fn restart_requests(&self) -> Vec<String> {
        self.restart_set.lock().unwrap().clone()
    }
}

#[async_trait]
impl LockServiceClient for FakeLockService {
    async fn set_restart_cn(&self, _tn_address: &str, uuid: &str) -> Result<bool, RpcError> {
        self.restart_set.lock().unwrap().push(uuid.to_string());
        Ok(true)
    }

    async fn can_restart_cn(&self, _tn_address: &str, uuid: &str) -> Result<bool, RpcError> {
        Ok(self.restartable.lock().unwrap().contains(uuid))
    }

    async fn remain_txn_count(&self, _tn_address: &str, uuid: &str) -> Result<i64, RpcError> {
        Ok(if self.restartable.lock().unwrap().contains(uuid) { 0 } else { 3 })
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeLoad {
    pub sessions: Vec<Session>,
    pub pipelines: i64,
    pub replicas: i64,
}

#[derive(Default)]
pub struct FakeQuery {
    load: Mutex<HashMap<String, FakeLoad>>,
}

impl FakeQuery {
    pub fn set_load(&self, address: &str, load: FakeLoad) {
        self.load.lock().unwrap().insert(address.to_string(), load);
    }

    fn get(&self, address: &str) -> Result<FakeLoad, RpcError> {
        self.load
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| RpcError::Http(format!("{address} unreachable")))
    }
}

#[async_trait]
impl QueryClient for FakeQuery {
    async fn show_process_list(&self, address: &str) -> Result<Vec<Session>, RpcError> {
        Ok(self.get(address)?.sessions)
    }

    async fn get_pipeline_info(&self, address: &str) -> Result<i64, RpcError> {
        Ok(self.get(address)?.pipelines)
    }

    async fn get_replica_count(&self, address: &str) -> Result<i64, RpcError> {
        Ok(self.get(address)?.replicas)
    }
}

#[derive(Default, Clone)]
pub struct FakeFactory {
    pub hakeeper: Arc<FakeHaKeeper>,
    pub lock: Arc<FakeLockService>,
    pub query: Arc<FakeQuery>,
}

impl ClientFactory for FakeFactory {
    fn hakeeper(&self, _discovery_address: &str) -> Result<Arc<dyn HaKeeperClient>, RpcError> {
        Ok(self.hakeeper.clone())
    }

    fn lock_service(&self) -> Arc<dyn LockServiceClient> {
        self.lock.clone()
    }

    fn query(&self) -> Arc<dyn QueryClient> {
        self.query.clone()
    }
}
