//! LogSet controller: the log service ensemble with HAKeeper embedded.

pub mod bucket;
pub mod resources;
pub mod stores;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::Api,
    runtime::{watcher, Controller},
    ResourceExt,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::*;

use self::bucket::BucketCheck;
use crate::api::v1alpha1::{
    logset::DEFAULT_STORE_FAILURE_TIMEOUT, ports, BucketBinding, BucketClaim, LogSet, LogSetDiscovery, LogSetSpec,
    LogSetStatus, RetentionPolicy, BOOTSTRAP_ANNO, LOGSET_COMPONENT,
};
use crate::controllers::common::{needs_update, reported_not_ready, selector, stale_config_maps, SPEC_HASH_ANNO};
use crate::reconciler::{run_controller, watch_all, Actor, Context, ReconcileContext, Reconciler};
use crate::util::{
    duration::parse_duration,
    errors::Result,
    status::{condition, set_status_condition, CONDITION_READY},
};

pub const CONTROLLER_NAME: &str = "logset";

/// Resync of settled LogSets; bounds how late a failed store is noticed
pub const LOGSET_RESYNC: Duration = Duration::from_secs(30);

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_BUCKET_IN_USE: &str = "InUse";
pub const REASON_NOT_ENOUGH_STORES: &str = "NoEnoughReadyStores";
pub const REASON_STORES_READY: &str = "StoresReady";
pub const REASON_BUCKET_NOT_BOUND: &str = "BucketNotBound";

pub enum LogSetAction {
    MarkNotReady { reason: &'static str, message: String },
    CreateBucketClaim(BucketClaim),
    BindBucket(BucketClaim, BucketBinding),
    UnbindBucket { name: String, owner: BucketBinding },
    CreateConfigMap(ConfigMap),
    ApplyServices(Vec<Service>),
    CreateStatefulSet(StatefulSet),
    UpdateStatefulSet(StatefulSet),
    CompleteBootstrap,
    Evict { pod: String, status: LogSetStatus },
    UpdateStatus(LogSetStatus),
    DeleteStaleConfigMaps(Vec<String>),
}

impl fmt::Display for LogSetAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogSetAction::MarkNotReady { reason, .. } => write!(f, "mark not ready ({reason})"),
            LogSetAction::CreateBucketClaim(c) => write!(f, "create bucket claim {}", c.name_any()),
            LogSetAction::BindBucket(claim, _) => write!(f, "bind bucket claim {}", claim.name_any()),
            LogSetAction::UnbindBucket { name, .. } => write!(f, "unbind bucket claim {name}"),
            LogSetAction::CreateConfigMap(cm) => write!(f, "create config map {}", cm.name_any()),
            LogSetAction::ApplyServices(_) => write!(f, "apply services"),
            LogSetAction::CreateStatefulSet(_) => write!(f, "create stateful set"),
            LogSetAction::UpdateStatefulSet(_) => write!(f, "update stateful set"),
            LogSetAction::CompleteBootstrap => write!(f, "complete bootstrap"),
            LogSetAction::Evict { pod, .. } => write!(f, "evict failed store {pod}"),
            LogSetAction::UpdateStatus(_) => write!(f, "update status"),
            LogSetAction::DeleteStaleConfigMaps(names) => write!(f, "delete stale config maps {names:?}"),
        }
    }
}

/// Outcome of an observation step that may stop the pass
enum Step {
    Continue,
    Act(LogSetAction),
    /// Blocked until the spec or another object changes
    Halt,
}

/// Reports a permanent problem once; later passes stay quiet
fn not_ready(status: &LogSetStatus, reason: &'static str, message: String) -> Step {
    if reported_not_ready(&status.conditions, reason, &message) {
        Step::Halt
    } else {
        Step::Act(LogSetAction::MarkNotReady { reason, message })
    }
}

/// Ready needs a quorum of stores up and, with S3 reclaim, the bucket claim in use
fn readiness(up: i32, replicas: i32, quorum: i32, bucket_in_use: bool) -> (bool, &'static str, String) {
    if up < quorum {
        (false, REASON_NOT_ENOUGH_STORES, format!("{up}/{replicas} stores up, quorum is {quorum}"))
    } else if !bucket_in_use {
        (false, REASON_BUCKET_NOT_BOUND, "bucket claim is not in use by this logset".to_string())
    } else {
        (true, REASON_STORES_READY, format!("{up}/{replicas} stores up"))
    }
}

fn ready_conditions(status: &LogSetStatus, ready: bool, reason: &str, message: String, generation: Option<i64>) -> Vec<Condition> {
    set_status_condition(
        &status.conditions,
        condition(CONDITION_READY, ready, reason, message, generation),
    )
    .0
}

pub fn failure_timeout(spec: &LogSetSpec) -> chrono::Duration {
    let raw = spec
        .store_failure_timeout
        .as_deref()
        .unwrap_or(DEFAULT_STORE_FAILURE_TIMEOUT);
    let timeout = parse_duration(raw)
        .or_else(|_| parse_duration(DEFAULT_STORE_FAILURE_TIMEOUT))
        .unwrap_or(std::time::Duration::from_secs(600));
    chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::minutes(10))
}

pub struct LogSetActor;

impl LogSetActor {
    /// The step the bucket binding asks for, and whether the bucket is in use by this LogSet
    async fn observe_bucket(&self, rc: &ReconcileContext<LogSet>, status: &LogSetStatus) -> Result<(Step, bool)> {
        let ls = rc.obj();
        let Some(s3) = &ls.spec.shared_storage.s3 else {
            return Ok((Step::Continue, true));
        };
        if !rc.config().feature_gates.s3_reclaim {
            return Ok((Step::Continue, true));
        }
        let me = bucket::binding(ls)?;
        let name = bucket::claim_name(s3);
        let claims = bucket::claims_of_path(rc, s3).await?;
        let step = match bucket::check(&claims, &me, &name) {
            BucketCheck::Conflict(owner) => not_ready(
                status,
                REASON_BUCKET_IN_USE,
                format!("bucket path {} is already used by logset {owner}", s3.path),
            ),
            BucketCheck::BackOff(owner) => Step::Act(LogSetAction::UnbindBucket { name, owner }),
            BucketCheck::Missing => Step::Act(LogSetAction::CreateBucketClaim(bucket::desired_claim(ls, s3))),
            BucketCheck::Unbound => match bucket::own_claim(&claims, &me, &name) {
                Some(claim) => Step::Act(LogSetAction::BindBucket(claim.clone(), me)),
                None => Step::Act(LogSetAction::CreateBucketClaim(bucket::desired_claim(ls, s3))),
            },
            BucketCheck::Bound => return Ok((Step::Continue, true)),
        };
        Ok((step, false))
    }

    fn bucket_claim_name(rc: &ReconcileContext<LogSet>) -> Option<String> {
        let s3 = rc.obj().spec.shared_storage.s3.as_ref()?;
        rc.config().feature_gates.s3_reclaim.then(|| bucket::claim_name(s3))
    }
}

#[async_trait]
impl Actor<LogSet> for LogSetActor {
    type Action = LogSetAction;

    async fn observe(&self, rc: &ReconcileContext<LogSet>) -> Result<Option<LogSetAction>> {
        let ls = rc.obj();
        let ns = rc.namespace();
        let status = ls.status.clone().unwrap_or_default();

        let (step, bucket_in_use) = match ls.spec.validate() {
            Err(message) => (not_ready(&status, REASON_INVALID_SPEC, message), false),
            Ok(()) => self.observe_bucket(rc, &status).await?,
        };
        match step {
            Step::Continue => {}
            Step::Act(action) => return Ok(Some(action)),
            Step::Halt => return Ok(None),
        }

        let cm = resources::config_map(ls, &rc.config().default_args.log_service)?;
        let cm_name = cm.name_any();
        if rc.get::<ConfigMap>(&cm_name).await?.is_none() {
            return Ok(Some(LogSetAction::CreateConfigMap(cm)));
        }

        let services = resources::services(ls);
        let mut services_stale = false;
        for svc in &services {
            let hash = svc.annotations().get(SPEC_HASH_ANNO).cloned().unwrap_or_default();
            match rc.get::<Service>(&svc.name_any()).await? {
                Some(existing) if !needs_update(&existing, &hash) => {}
                _ => {
                    services_stale = true;
                    break;
                }
            }
        }
        if services_stale {
            return Ok(Some(LogSetAction::ApplyServices(services)));
        }

        let existing = rc.get::<StatefulSet>(&resources::statefulset_name(ls)).await?;
        let bootstrapping = existing
            .as_ref()
            .map_or(true, |sts| sts.annotations().contains_key(BOOTSTRAP_ANNO));
        let desired = resources::statefulset(ls, &cm_name, bootstrapping);
        let hash = desired.annotations().get(SPEC_HASH_ANNO).cloned().unwrap_or_default();
        let sts = match existing {
            None => return Ok(Some(LogSetAction::CreateStatefulSet(desired))),
            Some(sts) if needs_update(&sts, &hash) => return Ok(Some(LogSetAction::UpdateStatefulSet(desired))),
            Some(sts) => sts,
        };

        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let pod_names: Vec<String> = (0..replicas).map(|i| resources::pod_name(ls, i)).collect();
        let pods = rc.list::<Pod>(&selector(LOGSET_COMPONENT, &ls.name_any())).await?;
        let now = Utc::now();
        let mut records = stores::store_records(&pod_names, &pods, &ns, &status.stores, now);
        let up = stores::up_count(&records);
        let quorum = ls.spec.quorum();

        if bootstrapping && up >= quorum {
            return Ok(Some(LogSetAction::CompleteBootstrap));
        }

        let (ready, reason, message) = readiness(up, replicas, quorum, bucket_in_use);
        let mut desired_status = LogSetStatus {
            conditions: ready_conditions(&status, ready, reason, message, ls.metadata.generation),
            stores: Vec::new(),
            discovery: Some(LogSetDiscovery {
                address: format!("{}.{ns}.svc", ls.discovery_service_name()),
                port: ports::HAKEEPER,
            }),
            bucket_claim: Self::bucket_claim_name(rc),
        };

        if rc.config().failover && !bootstrapping {
            let victim = stores::failover_candidate(&records, failure_timeout(&ls.spec), now)
                .map(|s| s.pod_name.clone())
                .filter(|name| pods.iter().any(|p| &p.name_any() == name));
            if let Some(pod) = victim {
                stores::reset_clock(&mut records, &pod, now);
                desired_status.stores = records;
                return Ok(Some(LogSetAction::Evict {
                    pod,
                    status: desired_status,
                }));
            }
        }

        desired_status.stores = records;
        if desired_status != status {
            return Ok(Some(LogSetAction::UpdateStatus(desired_status)));
        }

        if resources::rolled_out(&sts) && resources::mounted_config_map(&sts).as_deref() == Some(cm_name.as_str()) {
            let cms = rc.list::<ConfigMap>(&selector(LOGSET_COMPONENT, &ls.name_any())).await?;
            let stale = stale_config_maps(&cms, &ls.name_any(), &cm_name);
            if !stale.is_empty() {
                return Ok(Some(LogSetAction::DeleteStaleConfigMaps(stale)));
            }
        }
        Ok(None)
    }

    async fn act(&self, rc: &ReconcileContext<LogSet>, action: LogSetAction) -> Result<()> {
        let ls = rc.obj();
        match action {
            LogSetAction::MarkNotReady { reason, message } => {
                rc.warn(reason, message.clone()).await;
                let mut status = ls.status.clone().unwrap_or_default();
                status.conditions = ready_conditions(&status, false, reason, message, ls.metadata.generation);
                rc.patch_status(&status).await
            }
            LogSetAction::CreateBucketClaim(claim) => rc.create(claim).await,
            LogSetAction::BindBucket(claim, me) => bucket::bind(rc, &claim, &me).await,
            LogSetAction::UnbindBucket { name, owner } => {
                rc.warn(
                    REASON_BUCKET_IN_USE,
                    format!("bucket claim {name} was bound concurrently, {owner} keeps the path"),
                )
                .await;
                bucket::unbind(rc, &name).await
            }
            LogSetAction::CreateConfigMap(cm) => rc.create_owned(cm).await,
            LogSetAction::ApplyServices(services) => {
                for svc in services {
                    rc.apply_owned(svc).await?;
                }
                Ok(())
            }
            LogSetAction::CreateStatefulSet(sts) => rc.create_owned(sts).await,
            LogSetAction::UpdateStatefulSet(sts) => rc.apply_owned(sts).await.map(|_| ()),
            LogSetAction::CompleteBootstrap => {
                let patch = json!({ "metadata": { "annotations": { BOOTSTRAP_ANNO: null } } });
                rc.patch::<StatefulSet>(&resources::statefulset_name(ls), patch)
                    .await
                    .map(|_| ())
            }
            LogSetAction::Evict { pod, status } => {
                rc.warn(
                    "StoreFailover",
                    format!("store {pod} stayed down longer than the failure timeout"),
                )
                .await;
                rc.delete::<Pod>(&pod).await?;
                if ls.spec.pvc_retention_policy.unwrap_or(RetentionPolicy::Delete) == RetentionPolicy::Delete {
                    rc.delete::<PersistentVolumeClaim>(&resources::pvc_name(&pod)).await?;
                }
                rc.patch_status(&status).await
            }
            LogSetAction::UpdateStatus(status) => rc.patch_status(&status).await,
            LogSetAction::DeleteStaleConfigMaps(names) => {
                for name in names {
                    rc.delete::<ConfigMap>(&name).await?;
                }
                Ok(())
            }
        }
    }

    async fn finalize(&self, rc: &ReconcileContext<LogSet>) -> Result<bool> {
        let ls = rc.obj();
        let sts_name = resources::statefulset_name(ls);
        if let Some(sts) = rc.get::<StatefulSet>(&sts_name).await? {
            if sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0) > 0 {
                info!("cordoning stores of logset {}", ls.name_any());
                rc.patch::<StatefulSet>(&sts_name, json!({ "spec": { "replicas": 0 } }))
                    .await?;
                return Ok(false);
            }
            if sts.status.as_ref().is_some_and(|s| s.replicas > 0) {
                return Ok(false);
            }
            rc.delete::<StatefulSet>(&sts_name).await?;
        }
        for svc in [ls.headless_service_name(), ls.discovery_service_name()] {
            rc.delete::<Service>(&svc).await?;
        }
        for cm in rc.list::<ConfigMap>(&selector(LOGSET_COMPONENT, &ls.name_any())).await? {
            rc.delete::<ConfigMap>(&cm.name_any()).await?;
        }
        if let Some(s3) = &ls.spec.shared_storage.s3 {
            if rc.config().feature_gates.s3_reclaim {
                bucket::release(rc, s3).await?;
            }
        }
        if let Some(uid) = ls.uid() {
            rc.ctx.hakeeper.remove(&uid);
        }
        Ok(true)
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<LogSet>::all(client.clone()), watch_all())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client), watcher::Config::default());
    let reconciler = Reconciler::new(CONTROLLER_NAME, ctx, LogSetActor).settled_requeue(LOGSET_RESYNC);
    run_controller(controller, reconciler).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_problems_are_reported_once() {
        let status = LogSetStatus::default();
        let Step::Act(LogSetAction::MarkNotReady { reason, message }) =
            not_ready(&status, REASON_BUCKET_IN_USE, "taken".to_string())
        else {
            panic!("expected a MarkNotReady action");
        };
        let reported = LogSetStatus {
            conditions: ready_conditions(&status, false, reason, message, None),
            ..Default::default()
        };
        assert!(matches!(
            not_ready(&reported, REASON_BUCKET_IN_USE, "taken".to_string()),
            Step::Halt
        ));
        assert!(matches!(
            not_ready(&reported, REASON_INVALID_SPEC, "bad".to_string()),
            Step::Act(_)
        ));
    }

    #[test]
    fn ready_needs_quorum_and_bucket() {
        assert!(readiness(2, 3, 2, true).0);
        assert_eq!(readiness(1, 3, 2, true).1, REASON_NOT_ENOUGH_STORES);
        let (ready, reason, _) = readiness(3, 3, 2, false);
        assert!(!ready);
        assert_eq!(reason, REASON_BUCKET_NOT_BOUND);
    }

    #[test]
    fn failure_timeout_defaults_to_ten_minutes() {
        let mut spec = LogSetSpec::default();
        assert_eq!(failure_timeout(&spec), chrono::Duration::minutes(10));
        spec.store_failure_timeout = Some("90s".to_string());
        assert_eq!(failure_timeout(&spec), chrono::Duration::seconds(90));
        spec.store_failure_timeout = Some("soon".to_string());
        assert_eq!(failure_timeout(&spec), chrono::Duration::minutes(10));
        spec.store_failure_timeout = Some("100000000000000000000000h".to_string());
        assert_eq!(failure_timeout(&spec), chrono::Duration::minutes(10));
    }
}
