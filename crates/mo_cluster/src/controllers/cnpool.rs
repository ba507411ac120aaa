//! CNPool controller: keeps a warm set of idle CN pods through a CNSet of the pool.
//!
//! Pods enter the pool without a phase, become `Idle` once their store registers
//! (see the cnstore controller), are bound by claims and come back as `Idle` when
//! released. Surplus idle pods are marked `Terminating` and handed to the
//! CloneSet as `podsToDelete`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Api, ObjectMeta},
    runtime::{reflector::ObjectRef, watcher, Controller},
    ResourceExt,
};
use tracing::*;

use crate::api::v1alpha1::{
    CNClaim, CNClaimPhase, CNPodPhase, CNPool, CNPoolStatus, CNSet, CNSetSpec, CN_POD_PHASE_LABEL, POOL_NAME_LABEL,
};
use crate::controllers::common::{needs_update, pod_phase, spec_hash, with_spec_hash, SPEC_HASH_ANNO};
use crate::reconciler::{requeue_after, run_controller, watch_all, Actor, Context, ReconcileContext, Reconciler};
use crate::util::{
    errors::Result,
    selector::matches,
    status::{condition, set_status_condition, CONDITION_READY},
};

pub const CONTROLLER_NAME: &str = "cnpool";

pub const REASON_POOL_READY: &str = "PoolReady";
pub const REASON_SCALING: &str = "Scaling";
pub const REASON_MAX_PODS: &str = "MaxPodsReached";

/// Pending claims are not watched; pick them up on this interval
const POOL_RESYNC: Duration = Duration::from_secs(15);

pub enum CNPoolAction {
    MarkTerminating(Vec<Pod>),
    ApplyCNSet(CNSet),
    UpdateStatus(CNPoolStatus),
}

impl fmt::Display for CNPoolAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CNPoolAction::MarkTerminating(pods) => {
                let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
                write!(f, "scale in idle pods {names:?}")
            }
            CNPoolAction::ApplyCNSet(cn) => write!(f, "apply cnset with {} replicas", cn.spec.pod_set.replicas),
            CNPoolAction::UpdateStatus(_) => write!(f, "update status"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Started, store not registered yet
    pub starting: i32,
    pub idle: i32,
    pub bound: i32,
    pub draining: i32,
    pub terminating: i32,
}

impl PoolCounts {
    pub fn of(pods: &[Pod]) -> Self {
        let mut counts = PoolCounts::default();
        for pod in pods {
            match pod_phase(pod) {
                CNPodPhase::Unknown => counts.starting += 1,
                CNPodPhase::Idle => counts.idle += 1,
                CNPodPhase::Bound => counts.bound += 1,
                CNPodPhase::Draining => counts.draining += 1,
                CNPodPhase::Terminating => counts.terminating += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> i32 {
        self.starting + self.idle + self.bound + self.draining + self.terminating
    }

    /// Pods that stay after the terminating ones are gone
    pub fn active(&self) -> i32 {
        self.total() - self.terminating
    }

    pub fn by_phase(&self) -> [(CNPodPhase, i32); 5] {
        [
            (CNPodPhase::Unknown, self.starting),
            (CNPodPhase::Idle, self.idle),
            (CNPodPhase::Bound, self.bound),
            (CNPodPhase::Draining, self.draining),
            (CNPodPhase::Terminating, self.terminating),
        ]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolPlan {
    pub replicas: i32,
    /// Idle pods to retire, newest first
    pub scale_in: Vec<String>,
    pub pods_to_delete: Vec<String>,
    pub capped: bool,
}

/// Sizes the pool for `maxIdle` idle pods on top of every pending claim
pub fn plan(pool: &CNPool, pods: &[Pod], pending_claims: i32) -> PoolPlan {
    let strategy = &pool.spec.strategy.scale_strategy;
    let counts = PoolCounts::of(pods);
    let desired_idle = strategy.max_idle.max(0) + pending_claims;
    let available = counts.idle + counts.starting;

    let mut scale_in = Vec::new();
    if counts.idle > desired_idle {
        let mut idle: Vec<&Pod> = pods.iter().filter(|p| pod_phase(p) == CNPodPhase::Idle).collect();
        idle.sort_by(|a, b| b.creation_timestamp().cmp(&a.creation_timestamp()));
        scale_in = idle
            .iter()
            .take((counts.idle - desired_idle) as usize)
            .map(|p| p.name_any())
            .collect();
    }

    let staying = counts.active() - scale_in.len() as i32;
    let mut replicas = staying + (desired_idle - available).max(0);
    let mut capped = false;
    if let Some(max) = strategy.max_pods {
        let limit = max.max(staying);
        if replicas > limit {
            replicas = limit;
            capped = true;
        }
    }

    let mut pods_to_delete: Vec<String> = pods
        .iter()
        .filter(|p| pod_phase(p) == CNPodPhase::Terminating)
        .map(|p| p.name_any())
        .chain(scale_in.iter().cloned())
        .collect();
    pods_to_delete.sort();

    PoolPlan {
        replicas,
        scale_in,
        pods_to_delete,
        capped,
    }
}

/// Claims that wait for a pod of this pool
/// Listed idle pods retagged `Terminating`; the listed resourceVersion is kept so a
/// claim that binds the pod first wins the replace
pub fn terminating_pods(pods: &[Pod], names: &[String]) -> Vec<Pod> {
    pods.iter()
        .filter(|p| names.contains(&p.name_any()))
        .filter(|p| pod_phase(p) == CNPodPhase::Idle)
        .map(|p| {
            let mut pod = p.clone();
            pod.labels_mut()
                .insert(CN_POD_PHASE_LABEL.to_string(), CNPodPhase::Terminating.as_str().to_string());
            pod
        })
        .collect()
}

/// Pods a claim still holds; the pool cannot go away before they are released
pub fn claimed_pods(pods: &[Pod]) -> Vec<String> {
    pods.iter()
        .filter(|p| matches!(pod_phase(p), CNPodPhase::Bound | CNPodPhase::Draining))
        .map(|p| p.name_any())
        .collect()
}

pub fn pending_claims(pool: &CNPool, claims: &[CNClaim]) -> i32 {
    claims
        .iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .filter(|c| c.phase() == CNClaimPhase::Pending && c.spec.pod_name.is_none())
        .filter(|c| c.spec.pool_name.as_ref().map_or(true, |p| *p == pool.name_any()))
        .filter(|c| matches(&c.spec.selector, &pool.spec.pod_labels))
        .count() as i32
}

/// The CNSet backing the pool, named after it
pub fn desired_cnset(pool: &CNPool, plan: &PoolPlan) -> CNSet {
    let name = pool.name_any();
    let mut spec: CNSetSpec = pool.spec.template.clone();
    spec.pod_set.replicas = plan.replicas;
    for (k, v) in &pool.spec.pod_labels {
        spec.pod_labels.insert(k.clone(), v.clone());
    }
    spec.pod_labels.insert(POOL_NAME_LABEL.to_string(), name.clone());
    spec.pods_to_delete = plan.pods_to_delete.clone();
    spec.scaling_config.store_drain_enabled = Some(true);

    let meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: pool.namespace(),
        labels: Some(BTreeMap::from([(POOL_NAME_LABEL.to_string(), name)])),
        ..Default::default()
    };
    let hash = spec_hash(&spec);
    CNSet {
        metadata: with_spec_hash(meta, hash),
        spec,
        status: None,
    }
}

pub fn desired_status(pool: &CNPool, counts: &PoolCounts, plan: &PoolPlan) -> CNPoolStatus {
    let current = pool.status.clone().unwrap_or_default();
    let max_idle = pool.spec.strategy.scale_strategy.max_idle;
    let (ready, reason, message) = if counts.idle >= max_idle {
        (true, REASON_POOL_READY, format!("{} idle pods", counts.idle))
    } else if plan.capped {
        (
            false,
            REASON_MAX_PODS,
            format!("{} idle pods, pool is capped at {} pods", counts.idle, plan.replicas),
        )
    } else {
        (
            false,
            REASON_SCALING,
            format!("{}/{max_idle} idle pods, {} starting", counts.idle, counts.starting),
        )
    };
    let conditions: Vec<Condition> = set_status_condition(
        &current.conditions,
        condition(CONDITION_READY, ready, reason, message, pool.metadata.generation),
    )
    .0;
    CNPoolStatus {
        conditions,
        available_pods: counts.idle,
        claimed_pods: counts.bound + counts.draining,
        total_pods: counts.total(),
    }
}

pub struct CNPoolActor;

impl CNPoolActor {
    fn record_pods(rc: &ReconcileContext<CNPool>, counts: &PoolCounts) {
        let pool = rc.name();
        for (phase, n) in counts.by_phase() {
            rc.ctx
                .metrics
                .cn_pool_pods
                .with_label_values(&[pool.as_str(), phase.as_str()])
                .set(n as i64);
        }
    }

    fn forget_pods(rc: &ReconcileContext<CNPool>) {
        let pool = rc.name();
        for (phase, _) in PoolCounts::default().by_phase() {
            let _ = rc
                .ctx
                .metrics
                .cn_pool_pods
                .remove_label_values(&[pool.as_str(), phase.as_str()]);
        }
    }
}

#[async_trait]
impl Actor<CNPool> for CNPoolActor {
    type Action = CNPoolAction;

    async fn observe(&self, rc: &ReconcileContext<CNPool>) -> Result<Option<CNPoolAction>> {
        let pool = rc.obj();
        let pods = rc.list::<Pod>(&format!("{POOL_NAME_LABEL}={}", pool.name_any())).await?;
        let claims = rc.api::<CNClaim>().list(&Default::default()).await?.items;
        let plan = plan(pool, &pods, pending_claims(pool, &claims));
        let counts = PoolCounts::of(&pods);
        Self::record_pods(rc, &counts);

        let retiring = terminating_pods(&pods, &plan.scale_in);
        if !retiring.is_empty() {
            return Ok(Some(CNPoolAction::MarkTerminating(retiring)));
        }

        let desired = desired_cnset(pool, &plan);
        let hash = desired.annotations().get(SPEC_HASH_ANNO).cloned().unwrap_or_default();
        match rc.get::<CNSet>(&pool.name_any()).await? {
            Some(existing) if !needs_update(&existing, &hash) => {}
            _ => return Ok(Some(CNPoolAction::ApplyCNSet(desired))),
        }

        let status = desired_status(pool, &counts, &plan);
        if pool.status.as_ref() != Some(&status) {
            return Ok(Some(CNPoolAction::UpdateStatus(status)));
        }
        Ok(None)
    }

    async fn act(&self, rc: &ReconcileContext<CNPool>, action: CNPoolAction) -> Result<()> {
        match action {
            CNPoolAction::MarkTerminating(pods) => {
                let mut skipped = Vec::new();
                for pod in pods {
                    match rc.update(&pod).await {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() || e.is_not_found() => skipped.push(pod.name_any()),
                        Err(e) => return Err(e),
                    }
                }
                if skipped.is_empty() {
                    Ok(())
                } else {
                    Err(requeue_after(1, format!("idle pods {skipped:?} changed before scale in")))
                }
            }
            CNPoolAction::ApplyCNSet(cn) => rc.apply_owned(cn).await.map(|_| ()),
            CNPoolAction::UpdateStatus(status) => rc.patch_status(&status).await,
        }
    }

    /// Waits for every claim to let go of its pod, then removes the pool's CNSet
    async fn finalize(&self, rc: &ReconcileContext<CNPool>) -> Result<bool> {
        let pool = rc.obj();
        let pods = rc.list::<Pod>(&format!("{POOL_NAME_LABEL}={}", pool.name_any())).await?;
        let in_use = claimed_pods(&pods);
        if !in_use.is_empty() {
            info!("pool {} waits for claimed pods {in_use:?}", pool.name_any());
            return Ok(false);
        }
        if rc.get::<CNSet>(&pool.name_any()).await?.is_some() {
            rc.delete::<CNSet>(&pool.name_any()).await?;
            return Ok(false);
        }
        Self::forget_pods(rc);
        Ok(true)
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<CNPool>::all(client.clone()), watch_all())
        .owns(Api::<CNSet>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Pod>::all(client),
            watcher::Config::default().labels(POOL_NAME_LABEL),
            |pod: Pod| {
                let ns = pod.namespace()?;
                pod.labels()
                    .get(POOL_NAME_LABEL)
                    .map(|pool| ObjectRef::<CNPool>::new(pool).within(&ns))
            },
        );
    let reconciler = Reconciler::new(CONTROLLER_NAME, ctx, CNPoolActor).settled_requeue(POOL_RESYNC);
    run_controller(controller, reconciler).await
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::api::v1alpha1::{CNClaimSpec, CNClaimStatus, CNPoolSpec, PoolScaleStrategy, PoolStrategy};
    use crate::util::status::is_status_condition_true;

    fn pool(max_idle: i32, max_pods: Option<i32>) -> CNPool {
        CNPool {
            metadata: ObjectMeta {
                name: Some("pool".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: CNPoolSpec {
                template: CNSetSpec::default(),
                pod_labels: BTreeMap::from([("tier".to_string(), "serverless".to_string())]),
                strategy: PoolStrategy {
                    scale_strategy: PoolScaleStrategy { max_idle, max_pods },
                },
            },
            status: None,
        }
    }

    fn pod(name: &str, phase: Option<CNPodPhase>, created: i64) -> Pod {
        let mut labels = BTreeMap::from([(POOL_NAME_LABEL.to_string(), "pool".to_string())]);
        if let Some(p) = phase {
            labels.insert(CN_POD_PHASE_LABEL.to_string(), p.as_str().to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                creation_timestamp: Some(Time(Utc.timestamp_opt(created, 0).unwrap())),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn claim(name: &str, phase: CNClaimPhase, pool_name: Option<&str>, tier: &str) -> CNClaim {
        CNClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CNClaimSpec {
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("tier".to_string(), tier.to_string())])),
                    ..Default::default()
                },
                pool_name: pool_name.map(str::to_string),
                ..Default::default()
            },
            status: Some(CNClaimStatus {
                phase,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn empty_pool_scales_to_max_idle() {
        let p = plan(&pool(2, None), &[], 0);
        assert_eq!(p.replicas, 2);
        assert!(p.scale_in.is_empty());
    }

    #[test]
    fn starting_pods_count_toward_idle() {
        let pods = [pod("a", None, 1), pod("b", Some(CNPodPhase::Idle), 2)];
        assert_eq!(plan(&pool(2, None), &pods, 0).replicas, 2);
    }

    #[test]
    fn bound_pods_are_replaced_and_pending_claims_add_capacity() {
        let pods = [
            pod("a", Some(CNPodPhase::Bound), 1),
            pod("b", Some(CNPodPhase::Idle), 2),
            pod("c", Some(CNPodPhase::Idle), 3),
        ];
        assert_eq!(plan(&pool(2, None), &pods, 0).replicas, 3);
        assert_eq!(plan(&pool(2, None), &pods, 1).replicas, 4);
    }

    #[test]
    fn surplus_idle_pods_retire_newest_first() {
        let pods = [
            pod("old", Some(CNPodPhase::Idle), 1),
            pod("mid", Some(CNPodPhase::Idle), 2),
            pod("new", Some(CNPodPhase::Idle), 3),
            pod("gone", Some(CNPodPhase::Terminating), 0),
        ];
        let p = plan(&pool(1, None), &pods, 0);
        assert_eq!(p.scale_in, vec!["new".to_string(), "mid".to_string()]);
        assert_eq!(p.replicas, 1);
        assert_eq!(p.pods_to_delete, vec!["gone", "mid", "new"]);
    }

    #[test]
    fn scale_in_replaces_listed_idle_pods() {
        let mut listed = pod("new", Some(CNPodPhase::Idle), 3);
        listed.metadata.resource_version = Some("41".to_string());
        let pods = [
            pod("old", Some(CNPodPhase::Idle), 1),
            listed,
            pod("taken", Some(CNPodPhase::Bound), 2),
        ];
        let names = ["new".to_string(), "taken".to_string(), "missing".to_string()];
        let retiring = terminating_pods(&pods, &names);
        assert_eq!(retiring.len(), 1);
        assert_eq!(retiring[0].name_any(), "new");
        assert_eq!(pod_phase(&retiring[0]), CNPodPhase::Terminating);
        assert_eq!(retiring[0].resource_version().as_deref(), Some("41"));
        assert_eq!(retiring[0].labels()[POOL_NAME_LABEL], "pool");
    }

    #[test]
    fn finalize_waits_for_claimed_pods() {
        let pods = [
            pod("a", Some(CNPodPhase::Idle), 1),
            pod("b", Some(CNPodPhase::Bound), 2),
            pod("c", Some(CNPodPhase::Draining), 3),
            pod("d", Some(CNPodPhase::Terminating), 4),
            pod("e", None, 5),
        ];
        assert_eq!(claimed_pods(&pods), vec!["b", "c"]);
        assert!(claimed_pods(&pods[..1]).is_empty());
    }

    #[test]
    fn max_pods_caps_growth_without_evicting() {
        let pods = [
            pod("a", Some(CNPodPhase::Bound), 1),
            pod("b", Some(CNPodPhase::Bound), 2),
            pod("c", Some(CNPodPhase::Bound), 3),
        ];
        let p = plan(&pool(2, Some(2)), &pods, 0);
        assert_eq!(p.replicas, 3);
        assert!(p.capped);

        let status = desired_status(&pool(2, Some(2)), &PoolCounts::of(&pods), &p);
        assert!(!is_status_condition_true(&status.conditions, CONDITION_READY));
        assert_eq!(status.claimed_pods, 3);
        assert_eq!(status.total_pods, 3);
    }

    #[test]
    fn pending_claims_of_the_pool() {
        let pool = pool(1, None);
        let claims = [
            claim("a", CNClaimPhase::Pending, None, "serverless"),
            claim("b", CNClaimPhase::Pending, Some("pool"), "serverless"),
            claim("c", CNClaimPhase::Pending, Some("other"), "serverless"),
            claim("d", CNClaimPhase::Pending, None, "dedicated"),
            claim("e", CNClaimPhase::Bound, None, "serverless"),
        ];
        assert_eq!(pending_claims(&pool, &claims), 2);
    }

    #[test]
    fn pool_cnset_carries_pool_labels() {
        let pool = pool(1, None);
        let plan = PoolPlan {
            replicas: 3,
            pods_to_delete: vec!["x".to_string()],
            ..Default::default()
        };
        let cn = desired_cnset(&pool, &plan);
        assert_eq!(cn.name_any(), "pool");
        assert_eq!(cn.spec.pod_set.replicas, 3);
        assert_eq!(cn.spec.pod_labels[POOL_NAME_LABEL], "pool");
        assert_eq!(cn.spec.pod_labels["tier"], "serverless");
        assert_eq!(cn.spec.pods_to_delete, vec!["x"]);
        assert!(cn.spec.scaling_config.drain_enabled());
        assert!(!needs_update(&cn, &spec_hash(&cn.spec)));
    }
}
