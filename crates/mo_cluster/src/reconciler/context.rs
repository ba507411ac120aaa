use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::hakeeper::{ClientFactory, Manager};
use crate::util::{
    config::OperatorConfig,
    errors::{Error, Result},
    metrics,
};

pub const FIELD_MANAGER: &str = "mo-operator";

/// Objects the runtime can manage: namespaced and typed
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> ManagedResource for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Builds the context shared by every controller; call once per process
    pub fn to_context(
        &self,
        client: Client,
        config: OperatorConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Arc<Context>, prometheus::Error> {
        let metrics = metrics::Metrics::default().register(&self.registry)?;
        let hakeeper = Arc::new(Manager::new(
            client.clone(),
            factory,
            metrics.hakeeper_clients.clone(),
        ));
        Ok(Arc::new(Context {
            client,
            metrics,
            diagnostics: self.diagnostics.clone(),
            config: Arc::new(config),
            hakeeper,
        }))
    }
}

/// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: metrics::Metrics,
    /// Operator configuration directory contents
    pub config: Arc<OperatorConfig>,
    /// Long-lived HAKeeper clients keyed by LogSet uid
    pub hakeeper: Arc<Manager>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: FIELD_MANAGER.into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Everything a single reconciliation of `K` needs.
///
/// Every mutating helper publishes exactly one event against the subject.
pub struct ReconcileContext<K: ManagedResource> {
    pub ctx: Arc<Context>,
    pub controller: &'static str,
    obj: Arc<K>,
    recorder: Recorder,
}

impl<K: ManagedResource> ReconcileContext<K> {
    pub fn new(ctx: Arc<Context>, controller: &'static str, recorder: Recorder, obj: Arc<K>) -> Self {
        ReconcileContext {
            ctx,
            controller,
            obj,
            recorder,
        }
    }

    /// The latest copy of the subject fetched at the start of the reconciliation
    pub fn obj(&self) -> &K {
        &self.obj
    }

    pub fn name(&self) -> String {
        self.obj.name_any()
    }

    pub fn namespace(&self) -> String {
        self.obj.namespace().unwrap_or_default()
    }

    pub fn client(&self) -> Client {
        self.ctx.client.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.ctx.config
    }

    pub fn api<T: ManagedResource>(&self) -> Api<T> {
        Api::namespaced(self.client(), &self.namespace())
    }

    pub async fn get<T: ManagedResource>(&self, name: &str) -> Result<Option<T>> {
        Ok(self.api::<T>().get_opt(name).await?)
    }

    pub async fn list<T: ManagedResource>(&self, label_selector: &str) -> Result<Vec<T>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api::<T>().list(&lp).await?.items)
    }

    /// Creates `child` owned by the subject; an existing object is left untouched
    pub async fn create_owned<T: ManagedResource>(&self, mut child: T) -> Result<()> {
        self.own(&mut child);
        self.create(child).await
    }

    /// Creates an object in the subject's namespace without owning it
    pub async fn create<T: ManagedResource>(&self, mut child: T) -> Result<()> {
        if child.meta().namespace.is_none() {
            child.meta_mut().namespace = Some(self.namespace());
        }
        let kind = T::kind(&()).to_string();
        let name = child.name_any();
        match self.api::<T>().create(&PostParams::default(), &child).await {
            Ok(_) => {
                self.event(EventType::Normal, "CreateSuccess", format!("create {kind} {name}"))
                    .await;
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("{kind} {name} already exists");
                Ok(())
            }
            Err(e) => {
                self.event(EventType::Warning, "CreateFail", format!("create {kind} {name}: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Server-side applies `child` owned by the subject
    pub async fn apply_owned<T: ManagedResource>(&self, mut child: T) -> Result<T> {
        self.own(&mut child);
        let kind = T::kind(&()).to_string();
        let name = child.name_any();
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        match self.api::<T>().patch(&name, &pp, &Patch::Apply(&child)).await {
            Ok(applied) => {
                self.event(EventType::Normal, "UpdateSuccess", format!("apply {kind} {name}"))
                    .await;
                Ok(applied)
            }
            Err(e) => {
                self.event(EventType::Warning, "UpdateFail", format!("apply {kind} {name}: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Merge-patches any object in the subject's namespace
    pub async fn patch<T: ManagedResource>(&self, name: &str, patch: serde_json::Value) -> Result<T> {
        let kind = T::kind(&()).to_string();
        match self
            .api::<T>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(patched) => {
                self.event(EventType::Normal, "PatchSuccess", format!("patch {kind} {name}"))
                    .await;
                Ok(patched)
            }
            Err(e) => {
                self.event(EventType::Warning, "PatchFail", format!("patch {kind} {name}: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Replaces `obj`; fails with a conflict when its resourceVersion is stale
    pub async fn update<T: ManagedResource>(&self, obj: &T) -> Result<T> {
        let kind = T::kind(&()).to_string();
        let name = obj.name_any();
        let api: Api<T> = Api::namespaced(self.client(), &obj.namespace().unwrap_or_else(|| self.namespace()));
        match api.replace(&name, &PostParams::default(), obj).await {
            Ok(updated) => {
                self.event(EventType::Normal, "UpdateSuccess", format!("update {kind} {name}"))
                    .await;
                Ok(updated)
            }
            Err(e) => {
                self.event(EventType::Warning, "UpdateFail", format!("update {kind} {name}: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Deletes an object; absence counts as success
    pub async fn delete<T: ManagedResource>(&self, name: &str) -> Result<()> {
        let kind = T::kind(&()).to_string();
        match self.api::<T>().delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                self.event(EventType::Normal, "DeleteSuccess", format!("delete {kind} {name}"))
                    .await;
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => {
                self.event(EventType::Warning, "DeleteFail", format!("delete {kind} {name}: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Writes the status subresource of the subject only
    pub async fn patch_status<S: Serialize>(&self, status: &S) -> Result<()> {
        let patch = json!({ "status": status });
        self.api::<K>()
            .patch_status(&self.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Writes the status subresource of another object in the subject's namespace
    pub async fn patch_status_of<T: ManagedResource, S: Serialize>(&self, name: &str, status: &S) -> Result<()> {
        let kind = T::kind(&()).to_string();
        let patch = json!({ "status": status });
        match self
            .api::<T>()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                self.event(EventType::Normal, "PatchSuccess", format!("patch {kind} {name} status"))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.event(EventType::Warning, "PatchFail", format!("patch {kind} {name} status: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Merge-patches the subject itself (spec or metadata)
    pub async fn patch_self(&self, patch: serde_json::Value) -> Result<K> {
        self.patch::<K>(&self.name(), patch).await
    }

    /// Publishes an event against the subject; failures to publish are only logged
    pub async fn event(&self, type_: EventType, reason: &str, note: String) {
        let ev = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &self.obj.object_ref(&())).await {
            warn!("failed to publish event {reason}: {e}");
        }
    }

    pub async fn warn(&self, reason: &str, note: impl Into<String>) {
        self.event(EventType::Warning, reason, note.into()).await
    }

    fn own<T: ManagedResource>(&self, child: &mut T) {
        if let Some(oref) = self.obj.controller_owner_ref(&()) {
            let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
            if !refs.iter().any(|r| r.uid == oref.uid) {
                refs.push(oref);
            }
        }
        if child.meta().namespace.is_none() {
            child.meta_mut().namespace = Some(self.namespace());
        }
    }
}

/// Shorthand for a resync error
pub fn requeue_after(secs: u64, reason: impl Into<String>) -> Error {
    Error::requeue(std::time::Duration::from_secs(secs), reason)
}
