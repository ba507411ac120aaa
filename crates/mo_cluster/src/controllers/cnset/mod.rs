//! CNSet controller: a CloneSet of interchangeable CN stores.

pub mod resources;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::Api,
    runtime::{watcher, Controller},
    ResourceExt,
};

use crate::api::v1alpha1::{CNSet, CNSetStatus, CloneSet, LogSet, CNSET_COMPONENT};
use crate::controllers::common::{needs_update, reported_not_ready, selector, stale_config_maps, SPEC_HASH_ANNO};
use crate::reconciler::{
    dependency::{dnset_ready, ready_logset},
    requeue_after, run_controller, watch_all, Actor, Context, ReconcileContext, Reconciler,
};
use crate::util::{
    errors::Result,
    status::{condition, set_status_condition, CONDITION_READY},
};

pub const CONTROLLER_NAME: &str = "cnset";

pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_LOGSET_NOT_READY: &str = "LogSetNotReady";
pub const REASON_DNSET_NOT_READY: &str = "DNSetNotReady";
pub const REASON_REPLICAS_READY: &str = "ReplicasReady";
pub const REASON_WAITING_FOR_REPLICAS: &str = "WaitingForReplicas";

/// Poll interval while a dependency is not ready
const DEPENDENCY_RESYNC_SECS: u64 = 10;

pub enum CNSetAction {
    MarkNotReady { reason: &'static str, message: String },
    CreateConfigMap(ConfigMap),
    ApplyService(Service),
    CreateCloneSet(CloneSet),
    UpdateCloneSet(CloneSet),
    UpdateStatus(CNSetStatus),
    DeleteStaleConfigMaps(Vec<String>),
}

impl fmt::Display for CNSetAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CNSetAction::MarkNotReady { reason, .. } => write!(f, "mark not ready ({reason})"),
            CNSetAction::CreateConfigMap(cm) => write!(f, "create config map {}", cm.name_any()),
            CNSetAction::ApplyService(_) => write!(f, "apply service"),
            CNSetAction::CreateCloneSet(_) => write!(f, "create cloneset"),
            CNSetAction::UpdateCloneSet(_) => write!(f, "update cloneset"),
            CNSetAction::UpdateStatus(_) => write!(f, "update status"),
            CNSetAction::DeleteStaleConfigMaps(names) => write!(f, "delete stale config maps {names:?}"),
        }
    }
}

fn ready_conditions(status: &CNSetStatus, ready: bool, reason: &str, message: String, generation: Option<i64>) -> Vec<Condition> {
    set_status_condition(
        &status.conditions,
        condition(CONDITION_READY, ready, reason, message, generation),
    )
    .0
}

/// Status derived from the CloneSet; Ready once every desired replica is ready
pub fn desired_status(cn: &CNSet, cs: &CloneSet) -> CNSetStatus {
    let current = cn.status.clone().unwrap_or_default();
    let observed = cs.status.clone().unwrap_or_default();
    let desired = cn.spec.pod_set.replicas;
    let ready = observed.ready_replicas >= desired;
    let reason = if ready {
        REASON_REPLICAS_READY
    } else {
        REASON_WAITING_FOR_REPLICAS
    };
    let message = format!("{}/{desired} replicas ready", observed.ready_replicas);
    CNSetStatus {
        conditions: ready_conditions(&current, ready, reason, message, cn.metadata.generation),
        replicas: observed.replicas,
        ready_replicas: observed.ready_replicas,
        label_selector: Some(selector(CNSET_COMPONENT, &cn.name_any())),
    }
}

pub struct CNSetActor;

impl CNSetActor {
    /// Marks the set not ready once, then polls until the dependency recovers
    fn wait_for(status: &CNSetStatus, reason: &'static str, message: String) -> Result<Option<CNSetAction>> {
        if reported_not_ready(&status.conditions, reason, &message) {
            return Err(requeue_after(DEPENDENCY_RESYNC_SECS, message));
        }
        Ok(Some(CNSetAction::MarkNotReady { reason, message }))
    }

    async fn dependencies(&self, rc: &ReconcileContext<CNSet>) -> Result<Result<LogSet, (&'static str, String)>> {
        let cn = rc.obj();
        let ns = rc.namespace();
        let logset_ref = &cn.spec.logset_ref;
        let Some(ls) = ready_logset(&rc.client(), &ns, logset_ref).await? else {
            return Ok(Err((
                REASON_LOGSET_NOT_READY,
                format!("waiting for logset {}/{}", logset_ref.namespace_or(&ns), logset_ref.name),
            )));
        };
        if let Some(dn) = &cn.spec.dn_set_ref {
            if !dnset_ready(&rc.client(), &ns, dn).await? {
                return Ok(Err((
                    REASON_DNSET_NOT_READY,
                    format!("waiting for dnset {}/{}", dn.namespace_or(&ns), dn.name),
                )));
            }
        }
        Ok(Ok(ls))
    }
}

#[async_trait]
impl Actor<CNSet> for CNSetActor {
    type Action = CNSetAction;

    async fn observe(&self, rc: &ReconcileContext<CNSet>) -> Result<Option<CNSetAction>> {
        let cn = rc.obj();
        let status = cn.status.clone().unwrap_or_default();

        if let Err(message) = cn.spec.validate() {
            if reported_not_ready(&status.conditions, REASON_INVALID_SPEC, &message) {
                return Ok(None);
            }
            return Ok(Some(CNSetAction::MarkNotReady {
                reason: REASON_INVALID_SPEC,
                message,
            }));
        }

        let ls = match self.dependencies(rc).await? {
            Ok(ls) => ls,
            Err((reason, message)) => return Self::wait_for(&status, reason, message),
        };

        let cm = resources::config_map(cn, &ls, &rc.config().default_args.cn)?;
        let cm_name = cm.name_any();
        if rc.get::<ConfigMap>(&cm_name).await?.is_none() {
            return Ok(Some(CNSetAction::CreateConfigMap(cm)));
        }

        let svc = resources::service(cn);
        let svc_hash = svc.annotations().get(SPEC_HASH_ANNO).cloned().unwrap_or_default();
        match rc.get::<Service>(&svc.name_any()).await? {
            Some(existing) if !needs_update(&existing, &svc_hash) => {}
            _ => return Ok(Some(CNSetAction::ApplyService(svc))),
        }

        let desired = resources::cloneset(cn, &ls, &cm_name);
        let hash = desired.annotations().get(SPEC_HASH_ANNO).cloned().unwrap_or_default();
        let cs = match rc.get::<CloneSet>(&resources::cloneset_name(cn)).await? {
            None => return Ok(Some(CNSetAction::CreateCloneSet(desired))),
            Some(cs) if needs_update(&cs, &hash) => return Ok(Some(CNSetAction::UpdateCloneSet(desired))),
            Some(cs) => cs,
        };

        let next = desired_status(cn, &cs);
        if next != status {
            return Ok(Some(CNSetAction::UpdateStatus(next)));
        }

        if resources::rolled_out(&cs) && resources::mounted_config_map(&cs).as_deref() == Some(cm_name.as_str()) {
            let cms = rc.list::<ConfigMap>(&selector(CNSET_COMPONENT, &cn.name_any())).await?;
            let stale = stale_config_maps(&cms, &cn.name_any(), &cm_name);
            if !stale.is_empty() {
                return Ok(Some(CNSetAction::DeleteStaleConfigMaps(stale)));
            }
        }
        Ok(None)
    }

    async fn act(&self, rc: &ReconcileContext<CNSet>, action: CNSetAction) -> Result<()> {
        let cn = rc.obj();
        match action {
            CNSetAction::MarkNotReady { reason, message } => {
                rc.warn(reason, message.clone()).await;
                let mut status = cn.status.clone().unwrap_or_default();
                status.conditions = ready_conditions(&status, false, reason, message, cn.metadata.generation);
                rc.patch_status(&status).await
            }
            CNSetAction::CreateConfigMap(cm) => rc.create_owned(cm).await,
            CNSetAction::ApplyService(svc) => rc.apply_owned(svc).await.map(|_| ()),
            CNSetAction::CreateCloneSet(cs) => rc.create_owned(cs).await,
            CNSetAction::UpdateCloneSet(cs) => rc.apply_owned(cs).await.map(|_| ()),
            CNSetAction::UpdateStatus(status) => rc.patch_status(&status).await,
            CNSetAction::DeleteStaleConfigMaps(names) => {
                for name in names {
                    rc.delete::<ConfigMap>(&name).await?;
                }
                Ok(())
            }
        }
    }

    /// Owned objects are garbage collected; CN pods drain through their own finalizer
    async fn finalize(&self, _rc: &ReconcileContext<CNSet>) -> Result<bool> {
        Ok(true)
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<CNSet>::all(client.clone()), watch_all())
        .owns(Api::<CloneSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client), watcher::Config::default());
    run_controller(controller, Reconciler::new(CONTROLLER_NAME, ctx, CNSetActor)).await
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;
    use crate::api::v1alpha1::{cloneset::CloneSetStatus, CNSetSpec, CloneSetSpec, PodSet};
    use crate::util::status::{has_condition_reason, is_status_condition_true};

    fn cnset(replicas: i32) -> CNSet {
        CNSet {
            metadata: ObjectMeta {
                name: Some("cn".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: CNSetSpec {
                pod_set: PodSet {
                    replicas,
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    fn cloneset(ready: i32) -> CloneSet {
        CloneSet {
            metadata: ObjectMeta::default(),
            spec: CloneSetSpec::default(),
            status: Some(CloneSetStatus {
                replicas: 2,
                ready_replicas: ready,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn ready_when_all_replicas_ready() {
        let status = desired_status(&cnset(2), &cloneset(1));
        assert!(!is_status_condition_true(&status.conditions, CONDITION_READY));
        assert!(has_condition_reason(&status.conditions, CONDITION_READY, REASON_WAITING_FOR_REPLICAS));

        let status = desired_status(&cnset(2), &cloneset(2));
        assert!(is_status_condition_true(&status.conditions, CONDITION_READY));
        assert_eq!(status.label_selector.as_deref(), Some("matrixorigin.io/component=CNSet,matrixorigin.io/instance=cn"));
    }

    #[test]
    fn settled_status_is_stable() {
        let mut cn = cnset(2);
        let first = desired_status(&cn, &cloneset(2));
        cn.status = Some(first.clone());
        assert_eq!(desired_status(&cn, &cloneset(2)), first);
    }

    #[test]
    fn dependency_wait_is_reported_once() {
        let status = CNSetStatus::default();
        let action = CNSetActor::wait_for(&status, REASON_LOGSET_NOT_READY, "waiting".to_string()).unwrap();
        assert!(matches!(action, Some(CNSetAction::MarkNotReady { .. })));

        let reported = CNSetStatus {
            conditions: ready_conditions(&status, false, REASON_LOGSET_NOT_READY, "waiting".to_string(), None),
            ..Default::default()
        };
        let result = CNSetActor::wait_for(&reported, REASON_LOGSET_NOT_READY, "waiting".to_string());
        assert!(matches!(result, Err(crate::util::errors::Error::ErrorWithRequeue(_))));
    }
}
