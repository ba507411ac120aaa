//! Generic observe / act / finalize loop shared by every controller.
//!
//! A controller supplies an [`Actor`]. The runtime fetches the latest copy of the
//! object, handles deletion through [`Actor::finalize`], keeps the controller's
//! finalizer in place and otherwise executes the action [`Actor::observe`] asks for,
//! requeueing until the object settles.

pub mod context;
pub mod dependency;
pub mod finalizer;

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    ResourceExt,
};
use tokio::time::Duration;
use tracing::*;

pub use context::{requeue_after, Context, Diagnostics, ManagedResource, ReconcileContext, State, FIELD_MANAGER};

use crate::util::{
    errors::{Error, Result},
    telemetry,
};

/// Delay between passes while an action converges
pub const CONVERGE_REQUEUE: Duration = Duration::from_secs(1);
/// Delay between passes while finalization is pending
pub const FINALIZE_REQUEUE: Duration = Duration::from_secs(10);
/// Default resync of settled objects
pub const SETTLED_REQUEUE: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait Actor<K: ManagedResource>: Send + Sync + 'static {
    /// A named side effect `observe` asks the runtime to execute
    type Action: Display + Send;

    /// Compares spec and status; None when the object is settled
    async fn observe(&self, rc: &ReconcileContext<K>) -> Result<Option<Self::Action>>;

    async fn act(&self, rc: &ReconcileContext<K>, action: Self::Action) -> Result<()>;

    /// Cleanup during deletion; the finalizer is removed once this returns true
    async fn finalize(&self, rc: &ReconcileContext<K>) -> Result<bool>;
}

/// Where an object stands from the runtime's point of view
#[derive(Debug, PartialEq, Eq)]
pub enum Stage {
    Finalizing,
    /// The runtime finalizer goes on before the first observation
    NeedsFinalizer,
    Live,
}

pub fn stage<K: ResourceExt>(obj: &K, finalizer: Option<&str>) -> Stage {
    if obj.meta().deletion_timestamp.is_some() {
        return Stage::Finalizing;
    }
    match finalizer {
        Some(f) if !finalizer::has_finalizer(obj, f) => Stage::NeedsFinalizer,
        _ => Stage::Live,
    }
}

/// Next pass after `finalize`; the finalizer is dropped only once it reports done
pub fn after_finalize(done: bool) -> Action {
    if done {
        Action::await_change()
    } else {
        Action::requeue(FINALIZE_REQUEUE)
    }
}

/// Next pass after `observe`, depending on whether it asked for an action
pub fn after_observe(acted: bool, settled: Duration) -> Action {
    if acted {
        Action::requeue(CONVERGE_REQUEUE)
    } else {
        Action::requeue(settled)
    }
}

/// An object deleted before the pass started needs nothing more
pub fn still_present<K>(latest: Option<K>) -> std::result::Result<K, Action> {
    latest.ok_or_else(Action::await_change)
}

/// Turns expected failures into requeues; anything else is reported
pub fn recover(error: Error) -> Result<Action> {
    match error {
        Error::ErrorWithRequeue(e) => {
            debug!("resync after {:?}: {}", e.duration, e.error);
            Ok(Action::requeue(e.duration))
        }
        e if e.is_conflict() => {
            debug!("conflict, retrying: {e}");
            Ok(Action::requeue(CONVERGE_REQUEUE))
        }
        e => Err(e),
    }
}

/// An [`Actor`] bound to the shared context and its runtime settings
pub struct Reconciler<K: ManagedResource, A: Actor<K>> {
    pub name: &'static str,
    pub ctx: Arc<Context>,
    pub actor: A,
    /// Finalizer managed by the runtime; None when the actor manages its own
    pub finalizer: Option<String>,
    pub settled_requeue: Duration,
    pub concurrency: u16,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: ManagedResource, A: Actor<K>> Reconciler<K, A> {
    pub fn new(name: &'static str, ctx: Arc<Context>, actor: A) -> Self {
        Reconciler {
            name,
            ctx,
            actor,
            finalizer: Some(finalizer::finalizer_name(name)),
            settled_requeue: SETTLED_REQUEUE,
            concurrency: 1,
            _kind: std::marker::PhantomData,
        }
    }

    pub fn without_finalizer(mut self) -> Self {
        self.finalizer = None;
        self
    }

    pub fn settled_requeue(mut self, d: Duration) -> Self {
        self.settled_requeue = d;
        self
    }

    pub fn concurrency(mut self, n: u16) -> Self {
        self.concurrency = n;
        self
    }

    pub fn controller_config(&self) -> controller::Config {
        controller::Config::default().concurrency(self.concurrency)
    }

    async fn reconcile_latest(&self, api: &Api<K>, latest: K) -> Result<Action> {
        let recorder = self.ctx.diagnostics.read().await.recorder(self.ctx.client.clone());

        let latest = match (stage(&latest, self.finalizer.as_deref()), &self.finalizer) {
            (Stage::Finalizing, runtime_finalizer) => {
                let rc = ReconcileContext::new(self.ctx.clone(), self.name, recorder, Arc::new(latest));
                let done = self.actor.finalize(&rc).await?;
                if let (true, Some(f)) = (done, runtime_finalizer) {
                    finalizer::remove_finalizer(api, rc.obj(), f).await?;
                }
                return Ok(after_finalize(done));
            }
            (Stage::NeedsFinalizer, Some(f)) => finalizer::add_finalizer(api, &latest, f).await?.unwrap_or(latest),
            _ => latest,
        };

        let rc = ReconcileContext::new(self.ctx.clone(), self.name, recorder, Arc::new(latest));
        let action = self.actor.observe(&rc).await?;
        let acted = action.is_some();
        if let Some(action) = action {
            info!("{} {}/{}: {action}", self.name, rc.namespace(), rc.name());
            self.actor.act(&rc, action).await?;
        }
        Ok(after_observe(acted, self.settled_requeue))
    }

    async fn warn(&self, obj: &K, error: &Error) {
        let recorder = self.ctx.diagnostics.read().await.recorder(self.ctx.client.clone());
        let rc = ReconcileContext::new(self.ctx.clone(), self.name, recorder, Arc::new(obj.clone()));
        rc.warn("ReconcileError", error.to_string()).await;
    }
}

#[instrument(skip(obj, reconciler), fields(trace_id, controller = reconciler.name, name = %obj.name_any(), namespace = %obj.namespace().unwrap_or_default()))]
pub async fn reconcile<K, A>(obj: Arc<K>, reconciler: Arc<Reconciler<K, A>>) -> Result<Action>
where
    K: ManagedResource,
    A: Actor<K>,
{
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = reconciler.ctx.metrics.count_and_measure(reconciler.name);
    reconciler.ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = obj
        .namespace()
        .ok_or_else(|| Error::metadata_missing("namespace"))?;
    let api: Api<K> = Api::namespaced(reconciler.ctx.client.clone(), &ns);

    let latest = match still_present(api.get_opt(&obj.name_any()).await?) {
        Ok(latest) => latest,
        Err(done) => {
            debug!("{} is gone", obj.name_any());
            return Ok(done);
        }
    };

    match reconciler.reconcile_latest(&api, latest).await.or_else(recover) {
        Ok(action) => Ok(action),
        Err(e) => {
            reconciler.warn(&obj, &e).await;
            Err(e)
        }
    }
}

pub fn error_policy<K, A>(_obj: Arc<K>, error: &Error, reconciler: Arc<Reconciler<K, A>>) -> Action
where
    K: ManagedResource,
    A: Actor<K>,
{
    warn!("{} reconcile failed: {:?}", reconciler.name, error);
    reconciler.ctx.metrics.reconcile_failure(reconciler.name, error);
    Action::requeue(Duration::from_secs(15))
}

/// Fails when the CRD of `K` is not installed
pub async fn ensure_queryable<K: ManagedResource>(client: &kube::Client) -> Result<()> {
    let api = Api::<K>::all(client.clone());
    api.list(&kube::api::ListParams::default().limit(1)).await?;
    Ok(())
}

/// Drives a [`Controller`] to completion with the runtime's reconcile and error policy
pub async fn run_controller<K, A>(controller: Controller<K>, reconciler: Reconciler<K, A>)
where
    K: ManagedResource,
    A: Actor<K>,
{
    let name = reconciler.name;
    let config = reconciler.controller_config();
    info!("starting {name} controller");
    controller
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile::<K, A>, error_policy::<K, A>, Arc::new(reconciler))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    info!("{name} controller stopped");
}

/// Default watcher config for the primary resource
pub fn watch_all() -> watcher::Config {
    watcher::Config::default().any_semantic()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from apiserver"),
            reason: reason.to_string(),
            code,
        })
        .into()
    }

    fn pod(finalizers: &[&str], deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("cn-0".to_string()),
                finalizers: Some(finalizers.iter().map(ToString::to_string).collect()),
                deletion_timestamp: deleting.then(|| Time(Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn resync_errors_requeue_after_their_delay() {
        let action = recover(Error::requeue(Duration::from_secs(7), "logset not ready")).unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(7)));
        let action = recover(requeue_after(30, "waiting for an idle pod")).unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn conflicts_retry_quickly() {
        let action = recover(api_error(409, "Conflict")).unwrap();
        assert_eq!(action, Action::requeue(CONVERGE_REQUEUE));
    }

    #[test]
    fn other_errors_surface() {
        let err = recover(api_error(500, "InternalError")).unwrap_err();
        assert!(!err.is_conflict());
        assert!(recover(Error::invalid_spec("replicas must not be negative")).is_err());
    }

    #[test]
    fn deleted_object_is_left_alone() {
        assert_eq!(still_present::<Pod>(None).unwrap_err(), Action::await_change());
        assert_eq!(still_present(Some(pod(&[], false))).unwrap().name_any(), "cn-0");
    }

    #[test]
    fn finalizer_goes_on_before_observing() {
        let f = finalizer::finalizer_name("cnset");
        assert_eq!(stage(&pod(&[], false), Some(f.as_str())), Stage::NeedsFinalizer);
        assert_eq!(stage(&pod(&[f.as_str()], false), Some(f.as_str())), Stage::Live);
        assert_eq!(stage(&pod(&[], false), None), Stage::Live);
    }

    #[test]
    fn finalizer_comes_off_once_finalize_is_done() {
        let f = finalizer::finalizer_name("cnset");
        assert_eq!(stage(&pod(&[f.as_str()], true), Some(f.as_str())), Stage::Finalizing);
        assert_eq!(stage(&pod(&[], true), None), Stage::Finalizing);
        assert_eq!(after_finalize(false), Action::requeue(FINALIZE_REQUEUE));
        assert_eq!(after_finalize(true), Action::await_change());
    }

    #[test]
    fn settled_objects_resync_slowly() {
        assert_eq!(after_observe(true, SETTLED_REQUEUE), Action::requeue(CONVERGE_REQUEUE));
        assert_eq!(after_observe(false, Duration::from_secs(30)), Action::requeue(Duration::from_secs(30)));
    }
}
