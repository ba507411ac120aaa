use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::*;

use super::types::*;
use super::{ClientFactory, HaKeeperClient, LockServiceClient, QueryClient, RpcError};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared JSON-over-HTTP transport of every control plane client
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    scheme: &'static str,
}

impl Transport {
    pub fn new(ca_file: Option<&Path>) -> Result<Self, RpcError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        let mut scheme = "http";
        if let Some(path) = ca_file {
            let pem = std::fs::read(path)
                .map_err(|e| RpcError::Http(format!("read CA file {}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| RpcError::Http(format!("parse CA file {}: {e}", path.display())))?;
            builder = builder.add_root_certificate(cert);
            scheme = "https";
        }
        let client = builder
            .build()
            .map_err(|e| RpcError::Http(format!("build http client: {e}")))?;
        Ok(Transport { client, scheme })
    }

    async fn post<Req, Resp>(&self, address: &str, path: &str, body: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}://{}{}", self.scheme, address, path);
        debug!("POST {url}");
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout(url.clone())
            } else {
                RpcError::Http(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Status {
                endpoint: path.to_string(),
                code: status.as_u16(),
                body,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| RpcError::Decode(format!("{url}: {e}")))
    }
}

/// HAKeeper answers 404 on store endpoints when the store is not registered
fn store_not_exist(uuid: &str) -> impl FnOnce(RpcError) -> RpcError + '_ {
    move |e| match e {
        RpcError::Status { code: 404, .. } => RpcError::StoreNotExist(uuid.to_string()),
        e => e,
    }
}

pub struct HttpHaKeeperClient {
    transport: Transport,
    discovery_address: String,
}

#[async_trait]
impl HaKeeperClient for HttpHaKeeperClient {
    async fn get_cluster_details(&self) -> Result<ClusterDetails, RpcError> {
        self.transport
            .post(&self.discovery_address, "/hakeeper/v1/cluster-details", &serde_json::json!({}))
            .await
    }

    async fn patch_cn_store(&self, uuid: &str, state: WorkState, labels: Option<StoreLabels>) -> Result<(), RpcError> {
        let req = PatchCNStoreRequest {
            uuid: uuid.to_string(),
            state,
            labels,
        };
        self.transport
            .post::<_, serde_json::Value>(&self.discovery_address, "/hakeeper/v1/cn-store/patch", &req)
            .await
            .map(|_| ())
            .map_err(store_not_exist(uuid))
    }

    async fn update_cn_label(&self, uuid: &str, labels: StoreLabels) -> Result<(), RpcError> {
        let req = CNLabelRequest {
            uuid: uuid.to_string(),
            labels,
        };
        self.transport
            .post::<_, serde_json::Value>(&self.discovery_address, "/hakeeper/v1/cn-store/label", &req)
            .await
            .map(|_| ())
            .map_err(store_not_exist(uuid))
    }

    async fn delete_cn_store(&self, uuid: &str) -> Result<(), RpcError> {
        let req = StoreRequest { uuid: uuid.to_string() };
        self.transport
            .post::<_, serde_json::Value>(&self.discovery_address, "/hakeeper/v1/cn-store/delete", &req)
            .await
            .map(|_| ())
            .map_err(store_not_exist(uuid))
    }
}

pub struct HttpLockServiceClient {
    transport: Transport,
}

#[async_trait]
impl LockServiceClient for HttpLockServiceClient {
    async fn set_restart_cn(&self, tn_address: &str, uuid: &str) -> Result<bool, RpcError> {
        let resp: BoolResponse = self
            .transport
            .post(tn_address, "/lockservice/v1/set-restart-cn", &StoreRequest { uuid: uuid.to_string() })
            .await?;
        Ok(resp.ok)
    }

    async fn can_restart_cn(&self, tn_address: &str, uuid: &str) -> Result<bool, RpcError> {
        let resp: BoolResponse = self
            .transport
            .post(tn_address, "/lockservice/v1/can-restart-cn", &StoreRequest { uuid: uuid.to_string() })
            .await?;
        Ok(resp.ok)
    }

    async fn remain_txn_count(&self, tn_address: &str, uuid: &str) -> Result<i64, RpcError> {
        let resp: CountResponse = self
            .transport
            .post(tn_address, "/lockservice/v1/remain-txn-count", &StoreRequest { uuid: uuid.to_string() })
            .await?;
        Ok(resp.count)
    }
}

pub struct HttpQueryClient {
    transport: Transport,
}

#[async_trait]
impl QueryClient for HttpQueryClient {
    async fn show_process_list(&self, address: &str) -> Result<Vec<Session>, RpcError> {
        let resp: ProcessList = self
            .transport
            .post(address, "/query/v1/process-list", &serde_json::json!({}))
            .await?;
        Ok(resp.sessions)
    }

    async fn get_pipeline_info(&self, address: &str) -> Result<i64, RpcError> {
        let resp: CountResponse = self
            .transport
            .post(address, "/query/v1/pipeline-info", &serde_json::json!({}))
            .await?;
        Ok(resp.count)
    }

    async fn get_replica_count(&self, address: &str) -> Result<i64, RpcError> {
        let resp: CountResponse = self
            .transport
            .post(address, "/query/v1/replica-count", &serde_json::json!({}))
            .await?;
        Ok(resp.count)
    }
}

/// Builds reqwest backed clients sharing one connection pool
pub struct HttpClientFactory {
    transport: Transport,
}

impl HttpClientFactory {
    pub fn new(ca_file: Option<&Path>) -> Result<Self, RpcError> {
        Ok(HttpClientFactory {
            transport: Transport::new(ca_file)?,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn hakeeper(&self, discovery_address: &str) -> Result<Arc<dyn HaKeeperClient>, RpcError> {
        Ok(Arc::new(HttpHaKeeperClient {
            transport: self.transport.clone(),
            discovery_address: discovery_address.to_string(),
        }))
    }

    fn lock_service(&self) -> Arc<dyn LockServiceClient> {
        Arc::new(HttpLockServiceClient {
            transport: self.transport.clone(),
        })
    }

    fn query(&self) -> Arc<dyn QueryClient> {
        Arc::new(HttpQueryClient {
            transport: self.transport.clone(),
        })
    }
}
