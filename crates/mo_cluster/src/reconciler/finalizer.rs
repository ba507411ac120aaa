use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::*;

use super::context::ManagedResource;
use crate::api::v1alpha1::FINALIZER_PREFIX;
use crate::util::errors::Result;

/// `${prefix}/${controller}`
pub fn finalizer_name(controller: &str) -> String {
    format!("{FINALIZER_PREFIX}/{controller}")
}

pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Adds `finalizer` to `obj`, returning the updated object or None when already present.
///
/// The patch carries the observed resourceVersion so a concurrent writer causes a conflict.
pub async fn add_finalizer<K: ManagedResource>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<Option<K>> {
    if has_finalizer(obj, finalizer) {
        return Ok(None);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patched = patch_finalizers(api, obj, finalizers).await?;
    debug!("added finalizer {finalizer} to {}", obj.name_any());
    Ok(Some(patched))
}

/// Removes `finalizer` from `obj`; a no-op when absent
pub async fn remove_finalizer<K: ManagedResource>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()> {
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    match patch_finalizers(api, obj, finalizers).await {
        Ok(_) => {
            info!("removed finalizer {finalizer} from {}", obj.name_any());
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn patch_finalizers<K: ManagedResource>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<K> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    Ok(api
        .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}
