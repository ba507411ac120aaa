//! CNClaim controller: binds a claim to one pool pod and moves it between pods.
//!
//! Binding is a compare-and-swap on the pod: the claim replaces the pod with its
//! labels flipped to `Bound` under the resourceVersion it listed, and moves on to
//! the next candidate when another claim won the race.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams},
    runtime::{reflector::ObjectRef, watcher, Controller},
    ResourceExt,
};
use serde_json::json;
use tracing::*;

use crate::api::v1alpha1::{
    cnset::DEFAULT_MIN_DELAY, common::to_store_labels, CNClaim, CNClaimPhase, CNClaimStatus, CNPodPhase, CNPool,
    CNSet, CNStoreStatus, LifecycleState, MigrateStatus, Workload, CLAIMED_BY_LABEL, CN_POD_PHASE_LABEL,
    INSTANCE_LABEL, LIFECYCLE_STATE_LABEL, OWNER_NAME_LABEL, POOL_NAME_LABEL,
};
use crate::controllers::cnstore::stats::StoreScore;
use crate::controllers::common::pod_phase;
use crate::hakeeper::{cache::CNStoreInfo, ClientSet, RpcError, StoreLabels, WorkState};
use crate::reconciler::{
    dependency::ready_logset, requeue_after, run_controller, watch_all, Actor, Context, ReconcileContext, Reconciler,
};
use crate::util::{
    errors::{Error, Result},
    hash::store_uuid,
    selector::{matches, to_selector_string},
};

pub const CONTROLLER_NAME: &str = "cnclaim";

pub const REASON_LOST: &str = "PodLost";

const CLAIM_RESYNC_SECS: u64 = 5;

pub enum CNClaimAction {
    /// Candidates in order of preference
    Bind(Vec<Pod>),
    /// The pod is already labelled for this claim; finish the HAKeeper and claim side
    CompleteBind(Pod),
    SelectPool(String),
    MarkLost(String),
    SyncStoreLabels(Pod),
    UpdateStatus(CNClaimStatus),
    ReportMigration(Workload),
    DrainSource(String),
    FinishMigration,
}

impl fmt::Display for CNClaimAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CNClaimAction::Bind(pods) => write!(f, "bind one of {} idle pods", pods.len()),
            CNClaimAction::CompleteBind(pod) => write!(f, "complete binding of pod {}", pod.name_any()),
            CNClaimAction::SelectPool(pool) => write!(f, "select pool {pool}"),
            CNClaimAction::MarkLost(reason) => write!(f, "mark lost: {reason}"),
            CNClaimAction::SyncStoreLabels(pod) => write!(f, "sync store labels of pod {}", pod.name_any()),
            CNClaimAction::UpdateStatus(_) => write!(f, "update status"),
            CNClaimAction::ReportMigration(w) => write!(f, "report migration source workload {w:?}"),
            CNClaimAction::DrainSource(pod) => write!(f, "drain source pod {pod}"),
            CNClaimAction::FinishMigration => write!(f, "finish migration"),
        }
    }
}

fn claimed_by(pod: &Pod) -> Option<&str> {
    pod.labels().get(CLAIMED_BY_LABEL).map(String::as_str)
}

/// Whether `pod` is held by the claim named `claim`
pub fn held_by(pod: &Pod, claim: &str) -> bool {
    claimed_by(pod) == Some(claim) && matches!(pod_phase(pod), CNPodPhase::Bound | CNPodPhase::Draining)
}

/// Label selector of the idle pods a claim may take
pub fn candidate_selector(claim: &CNClaim) -> String {
    let mut terms = vec![format!("{CN_POD_PHASE_LABEL}={}", CNPodPhase::Idle.as_str())];
    let user = to_selector_string(&claim.spec.selector);
    if !user.is_empty() {
        terms.push(user);
    }
    if let Some(pool) = &claim.spec.pool_name {
        terms.push(format!("{POOL_NAME_LABEL}={pool}"));
    }
    terms.join(",")
}

/// Pods last used by the claim's owner come first
fn affinity(claim: &CNClaim, pod: &Pod) -> i32 {
    match &claim.spec.owner_name {
        Some(owner) if pod.labels().get(OWNER_NAME_LABEL) == Some(owner) => -1,
        _ => 0,
    }
}

pub fn sort_candidates(claim: &CNClaim, mut pods: Vec<Pod>) -> Vec<Pod> {
    pods.sort_by(|a, b| match affinity(claim, a).cmp(&affinity(claim, b)) {
        Ordering::Equal => a.creation_timestamp().cmp(&b.creation_timestamp()),
        other => other,
    });
    pods
}

/// Oldest pod already labelled for the claim by an interrupted binding
pub fn oldest_orphan(mut pods: Vec<Pod>) -> Option<Pod> {
    pods.sort_by(|a, b| a.creation_timestamp().cmp(&b.creation_timestamp()));
    pods.into_iter().next()
}

/// The pod relabelled as bound to `claim`, ready for a compare-and-swap replace
pub fn bound_pod(claim: &CNClaim, mut pod: Pod) -> Pod {
    let labels = pod.labels_mut();
    labels.insert(CN_POD_PHASE_LABEL.to_string(), CNPodPhase::Bound.as_str().to_string());
    labels.insert(CLAIMED_BY_LABEL.to_string(), claim.name_any());
    if let Some(owner) = &claim.spec.owner_name {
        labels.insert(OWNER_NAME_LABEL.to_string(), owner.clone());
    }
    pod
}

pub fn store_status(claim: &CNClaim, pod_name: &str, uuid: &str, info: Option<&CNStoreInfo>) -> CNStoreStatus {
    let info = info.cloned().unwrap_or_default();
    CNStoreStatus {
        service_id: uuid.to_string(),
        pod_name: pod_name.to_string(),
        sql_address: info.sql_address,
        query_address: info.query_address,
        pipeline_service_address: info.pipeline_service_address,
        lock_service_address: info.lock_service_address,
        work_state: info.work_state.to_string(),
        labels: claim.spec.cn_labels.clone(),
    }
}

/// Status of a claim bound to `pod_name`; the bound time is kept while the pod stays the same
pub fn bound_status(claim: &CNClaim, store: CNStoreStatus) -> CNClaimStatus {
    let current = claim.status.clone().unwrap_or_default();
    let same_pod = current.store.as_ref().is_some_and(|s| s.pod_name == store.pod_name);
    CNClaimStatus {
        phase: CNClaimPhase::Bound,
        bound_time: match current.bound_time {
            Some(t) if same_pod => Some(t),
            _ => Some(Time(Utc::now())),
        },
        migrate: if same_pod { current.migrate } else { None },
        store: Some(store),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BindStep {
    /// A pod already carries the claim's Bound label, left over from an interrupted bind
    Adopt(Pod),
    /// Idle pods in order of preference
    Bind(Vec<Pod>),
    SelectPool(String),
    Wait(String),
}

/// First pool serving the claim's selector
pub fn matching_pool(claim: &CNClaim, pools: &[CNPool]) -> Option<String> {
    pools
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .find(|p| matches(&claim.spec.selector, &p.spec.pod_labels))
        .map(|p| p.name_any())
}

/// Next binding step of an unbound claim. `pools` only matters when no idle pod
/// is available and the claim names no pool.
pub fn bind_step(claim: &CNClaim, orphans: Vec<Pod>, candidates: Vec<Pod>, pools: &[CNPool]) -> BindStep {
    if let Some(orphan) = oldest_orphan(orphans) {
        return BindStep::Adopt(orphan);
    }
    let candidates: Vec<Pod> = candidates
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();
    if !candidates.is_empty() {
        return BindStep::Bind(sort_candidates(claim, candidates));
    }
    match &claim.spec.pool_name {
        Some(pool) => BindStep::Wait(format!("waiting for an idle pod of pool {pool}")),
        None => match matching_pool(claim, pools) {
            Some(pool) => BindStep::SelectPool(pool),
            None => BindStep::Wait("no pool matches the claim selector".to_string()),
        },
    }
}

/// Bound pods of the claim relabelled Draining, at their listed resourceVersion
pub fn pods_to_release(claim: &CNClaim, pods: &[Pod]) -> Vec<Pod> {
    let name = claim.name_any();
    pods.iter()
        .filter(|p| held_by(p, &name) && pod_phase(p) == CNPodPhase::Bound)
        .map(|p| {
            let mut pod = p.clone();
            pod.labels_mut()
                .insert(CN_POD_PHASE_LABEL.to_string(), CNPodPhase::Draining.as_str().to_string());
            pod
        })
        .collect()
}

/// Pod the claim last reported as bound
fn recorded_pod(claim: &CNClaim) -> Option<&str> {
    claim
        .status
        .as_ref()
        .filter(|s| s.phase == CNClaimPhase::Bound)
        .and_then(|s| s.store.as_ref())
        .map(|s| s.pod_name.as_str())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationStep {
    Wait(Duration),
    Drain,
    Report(Workload),
    Finish,
}

fn workload(score: StoreScore) -> Workload {
    let clamp = |v: i64| v.clamp(0, i32::MAX as i64) as i32;
    Workload {
        connections: clamp(score.session_count),
        pipelines: clamp(score.pipeline_count),
        replicas: clamp(score.replica_count),
    }
}

/// Next step of moving the claim off `source` once the new pod is bound
pub fn migration_step(
    claim: &CNClaim,
    source: Option<&Pod>,
    min_delay: Duration,
    now: chrono::DateTime<Utc>,
) -> MigrationStep {
    let bound_for = claim
        .status
        .as_ref()
        .and_then(|s| s.bound_time.as_ref())
        .map(|t| (now - t.0).to_std().unwrap_or_default())
        .unwrap_or_default();
    if bound_for < min_delay {
        return MigrationStep::Wait(min_delay - bound_for);
    }
    let Some(source) = source else {
        return MigrationStep::Finish;
    };
    if !held_by(source, &claim.name_any()) {
        return MigrationStep::Finish;
    }
    match pod_phase(source) {
        CNPodPhase::Draining => MigrationStep::Report(workload(StoreScore::recorded(source).unwrap_or_default())),
        CNPodPhase::Bound => {
            let lifecycle = source
                .labels()
                .get(LIFECYCLE_STATE_LABEL)
                .map(|s| LifecycleState::parse(s.as_str()))
                .unwrap_or_default();
            if lifecycle == LifecycleState::PreparingDelete {
                MigrationStep::Wait(Duration::from_secs(CLAIM_RESYNC_SECS))
            } else {
                MigrationStep::Drain
            }
        }
        _ => MigrationStep::Finish,
    }
}

pub struct CNClaimActor;

impl CNClaimActor {
    /// HAKeeper clients of the LogSet serving `pod`
    async fn client_set(rc: &ReconcileContext<CNClaim>, pod: &Pod) -> Result<(Arc<ClientSet>, Option<CNSet>)> {
        let cn = match pod.labels().get(INSTANCE_LABEL) {
            Some(name) => rc.get::<CNSet>(name).await?,
            None => None,
        };
        let Some(cn) = cn else {
            return Err(requeue_after(
                CLAIM_RESYNC_SECS,
                format!("pod {} has no CNSet", pod.name_any()),
            ));
        };
        let Some(ls) = ready_logset(&rc.client(), &rc.namespace(), &cn.spec.logset_ref).await? else {
            return Err(requeue_after(
                CLAIM_RESYNC_SECS,
                format!("logset {} is not ready", cn.spec.logset_ref.name),
            ));
        };
        Ok((rc.ctx.hakeeper.get_client(&ls)?, Some(cn)))
    }

    fn desired_labels(claim: &CNClaim) -> StoreLabels {
        to_store_labels(&claim.spec.cn_labels)
    }

    async fn complete_bind(rc: &ReconcileContext<CNClaim>, pod: &Pod) -> Result<()> {
        let claim = rc.obj();
        let (set, _) = Self::client_set(rc, pod).await?;
        let uuid = store_uuid(&pod.name_any(), &rc.namespace());
        set.patch_cn_store(&uuid, WorkState::Working, Some(Self::desired_labels(claim)))
            .await?;
        set.cache.refresh_with(set.hakeeper.as_ref()).await;

        rc.patch_self(json!({
            "spec": {
                "podName": pod.name_any(),
                "poolName": pod.labels().get(POOL_NAME_LABEL),
            }
        }))
        .await?;
        let store = store_status(claim, &pod.name_any(), &uuid, set.cache.get_cn_store(&uuid).as_ref());
        rc.patch_status(&bound_status(claim, store)).await?;
        info!("claim {} bound to pod {}", claim.name_any(), pod.name_any());
        Ok(())
    }

    /// Flips the pod to Bound under the resourceVersion it was read with
    async fn try_claim(rc: &ReconcileContext<CNClaim>, pod: Pod) -> Result<Pod> {
        rc.update(&bound_pod(rc.obj(), pod)).await
    }

    async fn bind(rc: &ReconcileContext<CNClaim>) -> Result<Option<CNClaimAction>> {
        let claim = rc.obj();
        let orphans = rc
            .list::<Pod>(&format!(
                "{CLAIMED_BY_LABEL}={},{CN_POD_PHASE_LABEL}={}",
                claim.name_any(),
                CNPodPhase::Bound.as_str()
            ))
            .await?;
        let candidates = if orphans.is_empty() {
            rc.list::<Pod>(&candidate_selector(claim)).await?
        } else {
            Vec::new()
        };
        let pools = if orphans.is_empty() && candidates.is_empty() && claim.spec.pool_name.is_none() {
            rc.api::<CNPool>().list(&ListParams::default()).await?.items
        } else {
            Vec::new()
        };
        match bind_step(claim, orphans, candidates, &pools) {
            BindStep::Adopt(orphan) => Ok(Some(CNClaimAction::CompleteBind(orphan))),
            BindStep::Bind(pods) => Ok(Some(CNClaimAction::Bind(pods))),
            BindStep::SelectPool(pool) => Ok(Some(CNClaimAction::SelectPool(pool))),
            BindStep::Wait(reason) => Err(requeue_after(CLAIM_RESYNC_SECS, reason)),
        }
    }

    async fn migrate(rc: &ReconcileContext<CNClaim>, cn: Option<&CNSet>) -> Result<Option<CNClaimAction>> {
        let claim = rc.obj();
        let Some(source) = &claim.spec.source_pod else {
            return Ok(None);
        };
        let min_delay = cn
            .map(|c| c.spec.scaling_config.min_delay())
            .unwrap_or(DEFAULT_MIN_DELAY);
        let pod = rc.get::<Pod>(&source.pod_name).await?;
        match migration_step(claim, pod.as_ref(), min_delay, Utc::now()) {
            MigrationStep::Wait(d) => Err(Error::requeue(d, format!("migrating from {}", source.pod_name))),
            MigrationStep::Drain => Ok(Some(CNClaimAction::DrainSource(source.pod_name.clone()))),
            MigrationStep::Report(w) => {
                let current = claim.status.as_ref().and_then(|s| s.migrate.as_ref());
                if current.map(|m| &m.source) != Some(&w) {
                    return Ok(Some(CNClaimAction::ReportMigration(w)));
                }
                Err(requeue_after(
                    CLAIM_RESYNC_SECS,
                    format!("source pod {} is draining", source.pod_name),
                ))
            }
            MigrationStep::Finish => Ok(Some(CNClaimAction::FinishMigration)),
        }
    }
}

#[async_trait]
impl Actor<CNClaim> for CNClaimActor {
    type Action = CNClaimAction;

    async fn observe(&self, rc: &ReconcileContext<CNClaim>) -> Result<Option<CNClaimAction>> {
        let claim = rc.obj();
        if claim.phase() == CNClaimPhase::Lost {
            return Ok(None);
        }
        let Some(pod_name) = claim.spec.pod_name.clone() else {
            return Self::bind(rc).await;
        };

        let was_ours = recorded_pod(claim) == Some(pod_name.as_str());
        let Some(pod) = rc.get::<Pod>(&pod_name).await? else {
            if was_ours {
                return Ok(Some(CNClaimAction::MarkLost(format!("pod {pod_name} is gone"))));
            }
            return Err(requeue_after(CLAIM_RESYNC_SECS, format!("pod {pod_name} does not exist")));
        };

        if !held_by(&pod, &claim.name_any()) {
            if pod_phase(&pod) == CNPodPhase::Idle && pod.metadata.deletion_timestamp.is_none() {
                return Ok(Some(CNClaimAction::Bind(vec![pod])));
            }
            if was_ours {
                return Ok(Some(CNClaimAction::MarkLost(format!(
                    "pod {pod_name} is no longer claimed by {}",
                    claim.name_any()
                ))));
            }
            return Err(requeue_after(
                CLAIM_RESYNC_SECS,
                format!("pod {pod_name} is not idle"),
            ));
        }

        let (set, cn) = Self::client_set(rc, &pod).await?;
        let uuid = store_uuid(&pod_name, &rc.namespace());
        let info = set.cache.get_cn_store(&uuid);
        if let Some(info) = &info {
            if info.labels != Self::desired_labels(claim) && pod_phase(&pod) == CNPodPhase::Bound {
                return Ok(Some(CNClaimAction::SyncStoreLabels(pod)));
            }
        }
        let status = bound_status(claim, store_status(claim, &pod_name, &uuid, info.as_ref()));
        if claim.status.as_ref() != Some(&status) {
            return Ok(Some(CNClaimAction::UpdateStatus(status)));
        }
        Self::migrate(rc, cn.as_ref()).await
    }

    async fn act(&self, rc: &ReconcileContext<CNClaim>, action: CNClaimAction) -> Result<()> {
        let claim = rc.obj();
        match action {
            CNClaimAction::Bind(candidates) => {
                for pod in candidates {
                    let name = pod.name_any();
                    match Self::try_claim(rc, pod).await {
                        Ok(bound) => return Self::complete_bind(rc, &bound).await,
                        Err(e) if e.is_conflict() || e.is_not_found() => {
                            debug!("lost pod {name} to another claim, trying the next one");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(requeue_after(1, "every candidate was taken"))
            }
            CNClaimAction::CompleteBind(pod) => Self::complete_bind(rc, &pod).await,
            CNClaimAction::SelectPool(pool) => {
                rc.patch_self(json!({ "spec": { "poolName": pool } })).await?;
                Err(requeue_after(CLAIM_RESYNC_SECS, format!("waiting for pool {pool}")))
            }
            CNClaimAction::MarkLost(reason) => {
                rc.warn(REASON_LOST, reason).await;
                let mut status = claim.status.clone().unwrap_or_default();
                status.phase = CNClaimPhase::Lost;
                rc.patch_status(&status).await
            }
            CNClaimAction::SyncStoreLabels(pod) => {
                let (set, _) = Self::client_set(rc, &pod).await?;
                let uuid = store_uuid(&pod.name_any(), &rc.namespace());
                set.patch_cn_store(&uuid, WorkState::Working, Some(Self::desired_labels(claim)))
                    .await?;
                set.cache.refresh_with(set.hakeeper.as_ref()).await;
                Ok(())
            }
            CNClaimAction::UpdateStatus(status) => rc.patch_status(&status).await,
            CNClaimAction::ReportMigration(source) => {
                rc.patch_status(&json!({ "migrate": MigrateStatus { source } })).await
            }
            CNClaimAction::DrainSource(name) => {
                let patch = json!({
                    "metadata": { "labels": { LIFECYCLE_STATE_LABEL: LifecycleState::PreparingDelete.as_str() } }
                });
                rc.patch::<Pod>(&name, patch).await?;
                Ok(())
            }
            CNClaimAction::FinishMigration => {
                rc.patch_self(json!({ "spec": { "sourcePod": null } })).await?;
                rc.patch_status(&json!({ "migrate": null })).await
            }
        }
    }

    /// Hands every bound pod back to its pool through a drain
    async fn finalize(&self, rc: &ReconcileContext<CNClaim>) -> Result<bool> {
        let claim = rc.obj();
        let pods = rc
            .list::<Pod>(&format!("{CLAIMED_BY_LABEL}={}", claim.name_any()))
            .await?;
        for pod in pods_to_release(claim, &pods) {
            let uuid = store_uuid(&pod.name_any(), &rc.namespace());
            match Self::client_set(rc, &pod).await {
                Ok((set, _)) => match set.patch_cn_store(&uuid, WorkState::Draining, Some(StoreLabels::new())).await {
                    Ok(()) | Err(RpcError::StoreNotExist(_)) => {}
                    Err(e) => warn!("failed to drain store {uuid}, the pod will cordon itself: {e}"),
                },
                Err(e) => debug!("cannot reach HAKeeper for pod {}: {e}", pod.name_any()),
            }
            match rc.update(&pod).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<CNClaim>::all(client.clone()), watch_all()).watches(
        Api::<Pod>::all(client),
        watcher::Config::default().labels(CLAIMED_BY_LABEL),
        |pod: Pod| {
            let ns = pod.namespace()?;
            claimed_by(&pod).map(|claim| ObjectRef::<CNClaim>::new(claim).within(&ns))
        },
    );
    run_controller(controller, Reconciler::new(CONTROLLER_NAME, ctx, CNClaimActor)).await
}
