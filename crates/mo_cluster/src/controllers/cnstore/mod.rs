//! Per-pod controller of CN stores.
//!
//! Every CN pod is mirrored by a store in HAKeeper. This controller keeps the
//! two in step: it publishes the store's workload on the pod, keeps HAKeeper
//! labels and work state current, owns the pod's store readiness gate and
//! drives the drain a pod goes through before Kruise may update or delete it.
//! Pods of a pool additionally move through the phases in their phase label.

pub mod drain;
pub mod stats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, Controller},
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::*;

use self::drain::{
    clear_drain_annotations, drain_started, has_drain_annotations, lock_migration_step, next_drain_step,
    restart_annotations, DrainInput, DrainStep, LockStep, StoreState,
};
use self::stats::StoreScore;
use crate::api::v1alpha1::{
    common::to_store_labels, CNPodPhase, CNSet, LifecycleState, CLAIMED_BY_LABEL, CNSET_COMPONENT,
    CN_DRAINING_FINALIZER, CN_POD_PHASE_LABEL, CN_STATE_ANNO, CN_STORE_READINESS, COMPONENT_LABEL,
    DIAGNOSIS_DRAINING_ANNO, INSTANCE_LABEL, LIFECYCLE_STATE_LABEL, LOCK_RESTART_SET_ANNO, POOL_NAME_LABEL,
    STORE_DRAINING_START_ANNO,
};
use crate::hakeeper::{cache::CNStoreInfo, ClientSet, RpcError, StoreLabels, WorkState};
use crate::reconciler::{
    dependency::ready_logset,
    finalizer::{add_finalizer, has_finalizer, remove_finalizer},
    requeue_after, run_controller, Actor, Context, ReconcileContext, Reconciler,
};
use crate::util::{
    errors::{Error, Result},
    hash::store_uuid,
    status::{is_pod_condition_true, set_pod_condition},
    version::{Capability, ImageVersion},
};

pub const CONTROLLER_NAME: &str = "cnstore";

/// Keeps the published store score fresh
pub const STATS_RESYNC: Duration = Duration::from_secs(30);
const LOGSET_RESYNC_SECS: u64 = 5;
const REGISTRATION_RESYNC: Duration = Duration::from_secs(5);

/// Value of the cn-state annotation that cordons a store
pub const CORDON_STATE: &str = "Draining";

/// A change to the pod or its HAKeeper store
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    AddFinalizer,
    /// Sets (Some) or removes (None) pod annotations
    Annotate(BTreeMap<String, Option<String>>),
    PatchStore {
        state: WorkState,
        labels: Option<StoreLabels>,
    },
    UpdateLabels(StoreLabels),
    SetReadiness(bool),
    SetPhase(CNPodPhase),
    /// Resets the store to an unlabelled Working store and marks the pod Idle
    ReturnToPool,
    /// Asks the TN to move lock tables off the store
    SetRestart,
    /// Drops the drain bookkeeping and the finalizer so the pod may go
    Release,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreOp::AddFinalizer => write!(f, "add finalizer"),
            StoreOp::Annotate(a) => write!(f, "annotate {:?}", a.keys().collect::<Vec<_>>()),
            StoreOp::PatchStore { state, labels } => match labels {
                Some(l) => write!(f, "patch store to {state} with labels {l:?}"),
                None => write!(f, "patch store to {state}"),
            },
            StoreOp::UpdateLabels(l) => write!(f, "update store labels to {l:?}"),
            StoreOp::SetReadiness(ready) => write!(f, "set store readiness to {ready}"),
            StoreOp::SetPhase(phase) => write!(f, "set phase {phase}"),
            StoreOp::ReturnToPool => write!(f, "return to pool"),
            StoreOp::SetRestart => write!(f, "request lock migration"),
            StoreOp::Release => write!(f, "release pod"),
        }
    }
}

pub struct StoreAction {
    set: Arc<ClientSet>,
    uuid: String,
    op: StoreOp,
}

impl fmt::Display for StoreAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (store {})", self.op, self.uuid)
    }
}

/// What the pod needs next, before any RPC of the drain itself
#[derive(Clone, Debug, PartialEq)]
pub enum Next {
    Act(StoreOp),
    /// Run the drain; `complete` is applied once it finishes
    Drain { complete: StoreOp },
    Wait(Duration, String),
    Illegal(String),
    Settled,
}

/// Everything the decision needs, read off the pod, its CNSet and the store cache
#[derive(Clone, Debug)]
pub struct PodView {
    pub pool: bool,
    /// Err holds a phase label value this controller does not know
    pub phase: std::result::Result<CNPodPhase, String>,
    pub lifecycle: LifecycleState,
    pub cordoned: bool,
    pub store: Option<CNStoreInfo>,
    pub cache_filled: bool,
    pub ready: bool,
    pub drain_enabled: bool,
    pub desired_labels: StoreLabels,
    pub has_drain_annotations: bool,
    pub holds_finalizer: bool,
}

impl PodView {
    pub fn from_pod(pod: &Pod, cn: &CNSet, store: Option<CNStoreInfo>, cache_filled: bool) -> Self {
        let labels = pod.labels();
        let phase = match labels.get(CN_POD_PHASE_LABEL) {
            None => Ok(CNPodPhase::Unknown),
            Some(raw) => {
                let parsed = CNPodPhase::parse(raw);
                if parsed.as_str() == raw {
                    Ok(parsed)
                } else {
                    Err(raw.clone())
                }
            }
        };
        PodView {
            pool: labels.contains_key(POOL_NAME_LABEL),
            phase,
            lifecycle: labels
                .get(LIFECYCLE_STATE_LABEL)
                .map(|s| LifecycleState::parse(s))
                .unwrap_or_default(),
            cordoned: pod.annotations().get(CN_STATE_ANNO).map(String::as_str) == Some(CORDON_STATE),
            store,
            cache_filled,
            ready: is_pod_condition_true(pod, CN_STORE_READINESS),
            drain_enabled: cn.spec.scaling_config.drain_enabled(),
            desired_labels: to_store_labels(&cn.spec.cn_labels),
            has_drain_annotations: has_drain_annotations(pod),
            holds_finalizer: has_finalizer(pod, CN_DRAINING_FINALIZER),
        }
    }

    pub fn store_state(&self) -> StoreState {
        match (&self.store, self.cache_filled) {
            (Some(s), _) => StoreState::Registered(s.work_state),
            (None, true) => StoreState::Missing,
            (None, false) => StoreState::Unknown,
        }
    }
}

/// Cordon requested through the cn-state annotation
fn cordon(view: &PodView) -> Next {
    if let StoreState::Registered(WorkState::Working) = view.store_state() {
        return Next::Act(StoreOp::PatchStore {
            state: WorkState::Draining,
            labels: None,
        });
    }
    if view.ready {
        return Next::Act(StoreOp::SetReadiness(false));
    }
    Next::Settled
}

/// Pods of a CNSet that is not a pool
fn standalone(view: &PodView) -> Next {
    if view.lifecycle.is_preparing() {
        if !view.holds_finalizer {
            return Next::Settled;
        }
        if !view.drain_enabled {
            return Next::Act(StoreOp::Release);
        }
        return Next::Drain {
            complete: StoreOp::Release,
        };
    }

    let Some(store) = &view.store else {
        return Next::Wait(REGISTRATION_RESYNC, "store is not registered in HAKeeper yet".to_string());
    };
    if view.phase != Ok(CNPodPhase::Bound) {
        return Next::Act(StoreOp::SetPhase(CNPodPhase::Bound));
    }
    if view.has_drain_annotations {
        return Next::Act(StoreOp::Annotate(clear_drain_annotations()));
    }
    let labels_stale = store.labels != view.desired_labels;
    if store.work_state != WorkState::Working || (view.drain_enabled && labels_stale) {
        return Next::Act(StoreOp::PatchStore {
            state: WorkState::Working,
            labels: Some(view.desired_labels.clone()),
        });
    }
    if labels_stale {
        return Next::Act(StoreOp::UpdateLabels(view.desired_labels.clone()));
    }
    if !view.ready {
        return Next::Act(StoreOp::SetReadiness(true));
    }
    Next::Settled
}

/// Pods of a pool; labels of bound stores belong to the claim
fn pooled(view: &PodView) -> Next {
    let phase = match &view.phase {
        Ok(p) => *p,
        Err(raw) => return Next::Illegal(format!("unknown pool phase {raw:?}")),
    };
    let leaving = view.lifecycle.is_preparing();
    match phase {
        CNPodPhase::Unknown => match view.store_state() {
            StoreState::Registered(_) => Next::Act(StoreOp::SetPhase(CNPodPhase::Idle)),
            _ => Next::Wait(REGISTRATION_RESYNC, "store is not registered in HAKeeper yet".to_string()),
        },
        CNPodPhase::Idle | CNPodPhase::Bound if leaving => Next::Act(StoreOp::SetPhase(if phase == CNPodPhase::Idle {
            CNPodPhase::Terminating
        } else {
            CNPodPhase::Draining
        })),
        CNPodPhase::Idle | CNPodPhase::Bound if !view.ready => Next::Act(StoreOp::SetReadiness(true)),
        CNPodPhase::Idle | CNPodPhase::Bound => Next::Settled,
        CNPodPhase::Draining => Next::Drain {
            complete: if leaving {
                StoreOp::SetPhase(CNPodPhase::Terminating)
            } else {
                StoreOp::ReturnToPool
            },
        },
        CNPodPhase::Terminating if view.ready => Next::Act(StoreOp::SetReadiness(false)),
        CNPodPhase::Terminating if leaving && view.holds_finalizer => Next::Act(StoreOp::Release),
        CNPodPhase::Terminating => Next::Settled,
    }
}

pub fn decide(view: &PodView) -> Next {
    if view.cordoned {
        return cordon(view);
    }
    if view.pool {
        pooled(view)
    } else {
        standalone(view)
    }
}

/// Pods created outside a CloneSet are deleted by the operator itself
fn is_direct(pod: &Pod) -> bool {
    !pod.owner_references().iter().any(|r| r.controller == Some(true))
}

fn image_version(pod: &Pod) -> ImageVersion {
    let image = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    ImageVersion::from_image(&image)
}

pub struct CNStoreActor;

impl CNStoreActor {
    async fn owning_cnset(rc: &ReconcileContext<Pod>) -> Result<Option<CNSet>> {
        match rc.obj().labels().get(INSTANCE_LABEL) {
            Some(name) => rc.get::<CNSet>(name).await,
            None => Ok(None),
        }
    }

    /// Publishes the workload of the store; None when it cannot be queried
    async fn refresh_score(rc: &ReconcileContext<Pod>, store: Option<&CNStoreInfo>) -> Option<StoreScore> {
        let pod = rc.obj();
        let address = store.map(|s| s.query_address.as_str()).filter(|a| !a.is_empty())?;
        let query = rc.ctx.hakeeper.query();
        match stats::collect(query.as_ref(), address, &image_version(pod)).await {
            Ok((score, sessions)) => {
                if pod.annotations().contains_key(DIAGNOSIS_DRAINING_ANNO) && !sessions.is_empty() {
                    for s in &sessions {
                        info!(
                            "pod {} still serves connection {} of {}/{} {:?}",
                            pod.name_any(),
                            s.conn_id,
                            s.account,
                            s.user,
                            s.labels
                        );
                    }
                }
                Some(score)
            }
            Err(e) => {
                debug!("cannot query workload of {}: {e}", pod.name_any());
                None
            }
        }
    }

    async fn drain(
        rc: &ReconcileContext<Pod>,
        cn: &CNSet,
        view: &PodView,
        set: &ClientSet,
        uuid: &str,
        score: Option<StoreScore>,
        complete: StoreOp,
    ) -> Result<Option<StoreOp>> {
        let pod = rc.obj();
        let now = Utc::now();
        let scaling = &cn.spec.scaling_config;
        let input = DrainInput {
            now,
            started: drain_started(pod),
            timeout: scaling.drain_timeout(),
            min_delay: scaling.min_delay(),
            ready: view.ready,
            store: view.store_state(),
            score,
            lock_migration: image_version(pod).supports(Capability::LockMigration),
            diagnosed: pod.annotations().contains_key(DIAGNOSIS_DRAINING_ANNO),
        };
        let annotate = |key: &str| StoreOp::Annotate(BTreeMap::from([(key.to_string(), Some(now.to_rfc3339()))]));
        match next_drain_step(&input) {
            DrainStep::SetNotReady => Ok(Some(StoreOp::SetReadiness(false))),
            DrainStep::MarkStart => Ok(Some(annotate(STORE_DRAINING_START_ANNO))),
            DrainStep::ForceComplete => {
                rc.warn(
                    "DrainTimeout",
                    format!("store {uuid} did not drain within {:?}, completing anyway", input.timeout),
                )
                .await;
                Ok(Some(complete))
            }
            DrainStep::Cordon => Ok(Some(StoreOp::PatchStore {
                state: WorkState::Draining,
                labels: None,
            })),
            DrainStep::Diagnose => Ok(Some(annotate(DIAGNOSIS_DRAINING_ANNO))),
            DrainStep::Wait(d, reason) => Err(Error::requeue(d, reason)),
            DrainStep::MigrateLocks => {
                let can_restart = match set.can_restart_cn(uuid).await {
                    Ok(can) => can,
                    Err(RpcError::StoreNotExist(_)) => return Ok(Some(complete)),
                    Err(e) => return Err(e.into()),
                };
                match lock_migration_step(can_restart, pod.annotations().contains_key(LOCK_RESTART_SET_ANNO)) {
                    LockStep::Complete => Ok(Some(complete)),
                    LockStep::RequestRestart => Ok(Some(StoreOp::SetRestart)),
                    LockStep::Wait => {
                        let remain = set.remain_txn_count(uuid).await?;
                        info!("store {uuid} waits for {remain} transactions before its locks can move");
                        Err(Error::requeue(
                            REGISTRATION_RESYNC,
                            format!("{remain} transactions remain on store {uuid}"),
                        ))
                    }
                }
            }
            DrainStep::Complete => Ok(Some(complete)),
        }
    }

    async fn set_readiness(rc: &ReconcileContext<Pod>, ready: bool) -> Result<()> {
        let reason = if ready { "StoreReady" } else { "StoreNotServing" };
        match set_pod_condition(rc.obj(), CN_STORE_READINESS, ready, reason) {
            Some(conditions) => rc.patch_status(&json!({ "conditions": conditions })).await,
            None => Ok(()),
        }
    }

    async fn set_phase(rc: &ReconcileContext<Pod>, phase: CNPodPhase) -> Result<()> {
        let mut labels = serde_json::Map::new();
        labels.insert(CN_POD_PHASE_LABEL.to_string(), json!(phase.as_str()));
        if phase == CNPodPhase::Idle {
            labels.insert(CLAIMED_BY_LABEL.to_string(), serde_json::Value::Null);
        }
        let annotations = if phase == CNPodPhase::Draining {
            BTreeMap::new()
        } else {
            clear_drain_annotations()
        };
        rc.patch_self(json!({
            "metadata": {
                "labels": labels,
                "annotations": annotations,
            }
        }))
        .await?;
        Ok(())
    }

    /// Patches the store, refreshing the cache so the next pass sees the change
    async fn patch_store(set: &ClientSet, uuid: &str, state: WorkState, labels: Option<StoreLabels>) -> Result<()> {
        match set.patch_cn_store(uuid, state, labels).await {
            Ok(()) => {}
            // a store that is gone needs no drain
            Err(RpcError::StoreNotExist(_)) if state == WorkState::Draining => {}
            Err(e) => return Err(e.into()),
        }
        set.cache.refresh_with(set.hakeeper.as_ref()).await;
        Ok(())
    }
}

#[async_trait]
impl Actor<Pod> for CNStoreActor {
    type Action = StoreAction;

    async fn observe(&self, rc: &ReconcileContext<Pod>) -> Result<Option<StoreAction>> {
        let pod = rc.obj();
        let Some(cn) = Self::owning_cnset(rc).await? else {
            debug!("pod {} has no CNSet", pod.name_any());
            return Ok(None);
        };
        let ns = rc.namespace();
        let Some(ls) = ready_logset(&rc.client(), &ns, &cn.spec.logset_ref).await? else {
            return Err(requeue_after(
                LOGSET_RESYNC_SECS,
                format!("logset {} is not ready", cn.spec.logset_ref.name),
            ));
        };
        let set = rc.ctx.hakeeper.get_client(&ls)?;
        let uuid = store_uuid(&pod.name_any(), &ns);
        let act = |op: StoreOp| -> Result<Option<StoreAction>> {
            Ok(Some(StoreAction {
                set: set.clone(),
                uuid: uuid.clone(),
                op,
            }))
        };

        let view = PodView::from_pod(
            pod,
            &cn,
            set.cache.get_cn_store(&uuid),
            set.cache.snapshot().refreshed_at.is_some(),
        );
        if !view.lifecycle.is_preparing() && !view.holds_finalizer {
            return act(StoreOp::AddFinalizer);
        }

        let recorded = StoreScore::recorded(pod);
        let score = Self::refresh_score(rc, view.store.as_ref())
            .await
            .map(|score| score.since(recorded.as_ref(), Utc::now()));
        if let Some(score) = score {
            if recorded != Some(score) {
                let annotations = score.annotations().into_iter().map(|(k, v)| (k, Some(v))).collect();
                return act(StoreOp::Annotate(annotations));
            }
        }

        match decide(&view) {
            Next::Act(op) => act(op),
            Next::Drain { complete } => match Self::drain(rc, &cn, &view, &set, &uuid, score, complete).await? {
                Some(op) => act(op),
                None => Ok(None),
            },
            Next::Wait(d, reason) => Err(Error::requeue(d, reason)),
            Next::Illegal(reason) => {
                rc.warn("IllegalPhase", reason).await;
                Ok(None)
            }
            Next::Settled => Ok(None),
        }
    }

    async fn act(&self, rc: &ReconcileContext<Pod>, action: StoreAction) -> Result<()> {
        let pod = rc.obj();
        let StoreAction { set, uuid, op } = action;
        match op {
            StoreOp::AddFinalizer => {
                add_finalizer(&rc.api::<Pod>(), pod, CN_DRAINING_FINALIZER).await?;
                Ok(())
            }
            StoreOp::Annotate(annotations) => {
                rc.patch_self(json!({ "metadata": { "annotations": annotations } }))
                    .await?;
                Ok(())
            }
            StoreOp::PatchStore { state, labels } => Self::patch_store(&set, &uuid, state, labels).await,
            StoreOp::UpdateLabels(labels) => {
                set.hakeeper.update_cn_label(&uuid, labels).await?;
                set.cache.refresh_with(set.hakeeper.as_ref()).await;
                Ok(())
            }
            StoreOp::SetReadiness(ready) => Self::set_readiness(rc, ready).await,
            StoreOp::SetPhase(phase) => Self::set_phase(rc, phase).await,
            StoreOp::ReturnToPool => {
                match set.patch_cn_store(&uuid, WorkState::Working, Some(StoreLabels::new())).await {
                    Ok(()) | Err(RpcError::StoreNotExist(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                set.cache.refresh_with(set.hakeeper.as_ref()).await;
                Self::set_phase(rc, CNPodPhase::Idle).await
            }
            StoreOp::SetRestart => {
                let accepted = set.set_restart_cn(&uuid).await?;
                let Some(annotations) = restart_annotations(accepted) else {
                    return Err(Error::requeue(
                        REGISTRATION_RESYNC,
                        format!("TN did not accept moving the locks of store {uuid}"),
                    ));
                };
                rc.patch_self(json!({ "metadata": { "annotations": annotations } }))
                    .await?;
                Ok(())
            }
            StoreOp::Release => {
                let pod = rc
                    .patch_self(json!({ "metadata": { "annotations": clear_drain_annotations() } }))
                    .await?;
                remove_finalizer(&rc.api::<Pod>(), &pod, CN_DRAINING_FINALIZER).await?;
                if is_direct(&pod) && pod.meta().deletion_timestamp.is_none() {
                    rc.delete::<Pod>(&pod.name_any()).await?;
                }
                Ok(())
            }
        }
    }

    /// Deregisters the store; HAKeeper being unreachable does not hold the pod back
    async fn finalize(&self, rc: &ReconcileContext<Pod>) -> Result<bool> {
        let pod = rc.obj();
        let ns = rc.namespace();
        let uuid = store_uuid(&pod.name_any(), &ns);
        if let Some(cn) = Self::owning_cnset(rc).await? {
            if let Some(ls) = ready_logset(&rc.client(), &ns, &cn.spec.logset_ref).await? {
                let set = rc.ctx.hakeeper.get_client(&ls)?;
                match set.hakeeper.delete_cn_store(&uuid).await {
                    Ok(()) => info!("deleted store {uuid} of pod {}", pod.name_any()),
                    Err(RpcError::StoreNotExist(_)) => {}
                    Err(e) => warn!("failed to delete store {uuid} of pod {}: {e}", pod.name_any()),
                }
            }
        }
        remove_finalizer(&rc.api::<Pod>(), pod, CN_DRAINING_FINALIZER).await?;
        Ok(true)
    }
}

pub async fn run(ctx: Arc<Context>) {
    let pods = Api::<Pod>::all(ctx.client.clone());
    let wc = watcher::Config::default().labels(&format!("{COMPONENT_LABEL}={CNSET_COMPONENT}"));
    let reconciler = Reconciler::new(CONTROLLER_NAME, ctx, CNStoreActor)
        .without_finalizer()
        .settled_requeue(STATS_RESYNC)
        .concurrency(8);
    run_controller(Controller::new(pods, wc), reconciler).await
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::api::v1alpha1::{common::CNLabel, CNSetSpec, ScalingConfig};

    fn cnset(drain: bool) -> CNSet {
        CNSet {
            metadata: ObjectMeta {
                name: Some("cn".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CNSetSpec {
                scaling_config: ScalingConfig {
                    store_drain_enabled: Some(drain),
                    ..Default::default()
                },
                cn_labels: vec![CNLabel {
                    key: "account".to_string(),
                    values: vec!["acc1".to_string()],
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    fn pod(labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("cn-abcde".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                finalizers: Some(vec![CN_DRAINING_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: None,
        }
    }

    fn store(state: WorkState, labels: StoreLabels) -> CNStoreInfo {
        CNStoreInfo {
            service_id: "id".to_string(),
            query_address: "10.0.0.1:6005".to_string(),
            work_state: state,
            labels,
            ..Default::default()
        }
    }

    fn desired() -> StoreLabels {
        BTreeMap::from([("account".to_string(), vec!["acc1".to_string()])])
    }

    #[test]
    fn standalone_pod_becomes_bound_then_labelled_then_ready() {
        let cn = cnset(true);
        let p = pod(&[]);
        let view = PodView::from_pod(&p, &cn, None, true);
        assert!(matches!(decide(&view), Next::Wait(..)));

        let mut view = PodView::from_pod(&p, &cn, Some(store(WorkState::Working, StoreLabels::new())), true);
        assert_eq!(decide(&view), Next::Act(StoreOp::SetPhase(CNPodPhase::Bound)));

        view.phase = Ok(CNPodPhase::Bound);
        assert_eq!(
            decide(&view),
            Next::Act(StoreOp::PatchStore {
                state: WorkState::Working,
                labels: Some(desired()),
            })
        );

        view.store = Some(store(WorkState::Working, desired()));
        assert_eq!(decide(&view), Next::Act(StoreOp::SetReadiness(true)));

        view.ready = true;
        assert_eq!(decide(&view), Next::Settled);
    }

    #[test]
    fn labels_only_update_without_drain() {
        let cn = cnset(false);
        let p = pod(&[(CN_POD_PHASE_LABEL, "Bound")]);
        let view = PodView::from_pod(&p, &cn, Some(store(WorkState::Working, StoreLabels::new())), true);
        assert_eq!(decide(&view), Next::Act(StoreOp::UpdateLabels(desired())));

        // an uncordoned store goes back to work
        let view = PodView::from_pod(&p, &cn, Some(store(WorkState::Draining, desired())), true);
        assert!(matches!(
            decide(&view),
            Next::Act(StoreOp::PatchStore {
                state: WorkState::Working,
                ..
            })
        ));
    }

    #[test]
    fn preparing_pod_drains_or_releases() {
        let p = pod(&[(CN_POD_PHASE_LABEL, "Bound"), (LIFECYCLE_STATE_LABEL, "PreparingDelete")]);
        let view = PodView::from_pod(&p, &cnset(true), Some(store(WorkState::Working, desired())), true);
        assert_eq!(
            decide(&view),
            Next::Drain {
                complete: StoreOp::Release
            }
        );

        let mut view = PodView::from_pod(&p, &cnset(false), Some(store(WorkState::Working, desired())), true);
        assert_eq!(decide(&view), Next::Act(StoreOp::Release));

        view.holds_finalizer = false;
        assert_eq!(decide(&view), Next::Settled);
    }

    #[test]
    fn cordon_takes_precedence() {
        let mut p = pod(&[(CN_POD_PHASE_LABEL, "Bound")]);
        p.metadata.annotations = Some(BTreeMap::from([(CN_STATE_ANNO.to_string(), CORDON_STATE.to_string())]));
        let mut view = PodView::from_pod(&p, &cnset(true), Some(store(WorkState::Working, desired())), true);
        assert_eq!(
            decide(&view),
            Next::Act(StoreOp::PatchStore {
                state: WorkState::Draining,
                labels: None
            })
        );
        view.store = Some(store(WorkState::Draining, desired()));
        view.ready = true;
        assert_eq!(decide(&view), Next::Act(StoreOp::SetReadiness(false)));
    }

    #[test]
    fn pool_phases() {
        let cn = cnset(true);
        let registered = Some(store(WorkState::Working, StoreLabels::new()));

        let p = pod(&[(POOL_NAME_LABEL, "pool")]);
        assert_eq!(
            decide(&PodView::from_pod(&p, &cn, registered.clone(), true)),
            Next::Act(StoreOp::SetPhase(CNPodPhase::Idle))
        );
        assert!(matches!(decide(&PodView::from_pod(&p, &cn, None, true)), Next::Wait(..)));

        let p = pod(&[(POOL_NAME_LABEL, "pool"), (CN_POD_PHASE_LABEL, "Draining")]);
        assert_eq!(
            decide(&PodView::from_pod(&p, &cn, registered.clone(), true)),
            Next::Drain {
                complete: StoreOp::ReturnToPool
            }
        );

        let p = pod(&[
            (POOL_NAME_LABEL, "pool"),
            (CN_POD_PHASE_LABEL, "Bound"),
            (LIFECYCLE_STATE_LABEL, "PreparingDelete"),
        ]);
        assert_eq!(
            decide(&PodView::from_pod(&p, &cn, registered.clone(), true)),
            Next::Act(StoreOp::SetPhase(CNPodPhase::Draining))
        );

        let p = pod(&[
            (POOL_NAME_LABEL, "pool"),
            (CN_POD_PHASE_LABEL, "Draining"),
            (LIFECYCLE_STATE_LABEL, "PreparingDelete"),
        ]);
        assert_eq!(
            decide(&PodView::from_pod(&p, &cn, registered.clone(), true)),
            Next::Drain {
                complete: StoreOp::SetPhase(CNPodPhase::Terminating)
            }
        );

        let p = pod(&[
            (POOL_NAME_LABEL, "pool"),
            (CN_POD_PHASE_LABEL, "Terminating"),
            (LIFECYCLE_STATE_LABEL, "PreparingDelete"),
        ]);
        assert_eq!(decide(&PodView::from_pod(&p, &cn, None, true)), Next::Act(StoreOp::Release));

        let p = pod(&[(POOL_NAME_LABEL, "pool"), (CN_POD_PHASE_LABEL, "Borrowed")]);
        assert!(matches!(decide(&PodView::from_pod(&p, &cn, registered, true)), Next::Illegal(_)));
    }

    #[test]
    fn store_state_distinguishes_empty_cache() {
        let view = PodView::from_pod(&pod(&[]), &cnset(true), None, false);
        assert_eq!(view.store_state(), StoreState::Unknown);
        let view = PodView::from_pod(&pod(&[]), &cnset(true), None, true);
        assert_eq!(view.store_state(), StoreState::Missing);
    }

    #[test]
    fn direct_pods_have_no_controller() {
        let mut p = pod(&[]);
        assert!(is_direct(&p));
        p.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps.kruise.io/v1alpha1".to_string(),
            kind: "CloneSet".to_string(),
            name: "cn".to_string(),
            uid: "u1".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        assert!(!is_direct(&p));
    }
}
