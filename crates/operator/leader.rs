use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::*;

pub const LEASE_NAME: &str = "mo-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: kube::Client, namespace: &str, identity: &str) -> Self {
        LeaderElector {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Blocks until this process holds the lease
    pub async fn acquire(&self) {
        info!("waiting for leader lease {}/{LEASE_NAME} as {}", self.namespace, self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("acquired leader lease {LEASE_NAME}");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("leader election failed: {e}"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease until it is lost, then returns
    pub async fn hold(&self) {
        let mut failing_since: Option<chrono::DateTime<Utc>> = None;
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => failing_since = None,
                Ok(false) => {
                    error!("leader lease {LEASE_NAME} was taken over");
                    return;
                }
                Err(e) => {
                    let since = *failing_since.get_or_insert_with(Utc::now);
                    warn!("failed to renew leader lease: {e}");
                    if Utc::now() - since > chrono::Duration::seconds(LEASE_DURATION_SECS as i64) {
                        error!("leader lease {LEASE_NAME} expired while renewal kept failing");
                        return;
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let Some(existing) = self.leases.get_opt(LEASE_NAME).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            return match self.leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e),
            };
        };

        let spec = existing.spec.unwrap_or_default();
        let holder = spec.holder_identity.as_deref();
        let mut patch = json!({
            "metadata": { "resourceVersion": existing.metadata.resource_version },
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        if holder != Some(self.identity.as_str()) {
            let expired = spec.renew_time.as_ref().map_or(true, |renew| {
                let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS);
                now > renew.0 + chrono::Duration::seconds(duration as i64)
            });
            if !expired {
                return Ok(false);
            }
            info!("leader lease held by {holder:?} expired, taking over");
            patch["spec"]["holderIdentity"] = json!(self.identity);
            patch["spec"]["acquireTime"] = json!(MicroTime(now));
        }
        match self
            .leases
            .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }
}
