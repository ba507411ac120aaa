//! Clients of the database control plane: HAKeeper, the TN lock service and
//! the per-CN query service, plus the per-LogSet client cache.

pub mod cache;
#[cfg(test)]
pub mod fake;
pub mod http;
pub mod manager;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::{Snapshot, StoreCache};
pub use http::HttpClientFactory;
pub use manager::{ClientSet, Manager};
pub use types::*;

use crate::api::v1alpha1::{common::ports, LogSet};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("{endpoint} returned {code}: {body}")]
    Status {
        endpoint: String,
        code: u16,
        body: String,
    },

    #[error("store {0} does not exist")]
    StoreNotExist(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("no TN store registered")]
    NoTNStore,
}

#[async_trait]
pub trait HaKeeperClient: Send + Sync {
    async fn get_cluster_details(&self) -> Result<ClusterDetails, RpcError>;

    /// Sets the work state of a CN store, replacing its labels when given
    async fn patch_cn_store(&self, uuid: &str, state: WorkState, labels: Option<StoreLabels>) -> Result<(), RpcError>;

    async fn update_cn_label(&self, uuid: &str, labels: StoreLabels) -> Result<(), RpcError>;

    async fn delete_cn_store(&self, uuid: &str) -> Result<(), RpcError>;
}

/// Lock service of the TN, addressed per call
#[async_trait]
pub trait LockServiceClient: Send + Sync {
    async fn set_restart_cn(&self, tn_address: &str, uuid: &str) -> Result<bool, RpcError>;

    async fn can_restart_cn(&self, tn_address: &str, uuid: &str) -> Result<bool, RpcError>;

    async fn remain_txn_count(&self, tn_address: &str, uuid: &str) -> Result<i64, RpcError>;
}

/// Query service of a single CN
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn show_process_list(&self, address: &str) -> Result<Vec<Session>, RpcError>;

    async fn get_pipeline_info(&self, address: &str) -> Result<i64, RpcError>;

    async fn get_replica_count(&self, address: &str) -> Result<i64, RpcError>;
}

/// Builds the RPC clients; swapped for fakes in tests
pub trait ClientFactory: Send + Sync {
    fn hakeeper(&self, discovery_address: &str) -> Result<Arc<dyn HaKeeperClient>, RpcError>;

    fn lock_service(&self) -> Arc<dyn LockServiceClient>;

    fn query(&self) -> Arc<dyn QueryClient>;
}

/// `<logset>-discovery.<ns>.svc:32001`
pub fn discovery_address(logset: &LogSet) -> String {
    format!(
        "{}.{}.svc:{}",
        logset.discovery_service_name(),
        logset.metadata.namespace.clone().unwrap_or_default(),
        ports::HAKEEPER
    )
}
