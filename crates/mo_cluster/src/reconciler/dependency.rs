//! "Is object X ready" predicates for controllers that must wait on another resource.

use kube::{
    api::{Api, ApiResource, DynamicObject, GroupVersionKind},
    client::Client,
};

use crate::api::v1alpha1::{common::ObjectRef, LogSet, GROUP, VERSION};
use crate::util::errors::Result;

/// Returns the LogSet when it exists and reports `Ready=True`
pub async fn ready_logset(client: &Client, default_ns: &str, logset_ref: &ObjectRef) -> Result<Option<LogSet>> {
    let api: Api<LogSet> = Api::namespaced(client.clone(), logset_ref.namespace_or(default_ns));
    Ok(api.get_opt(&logset_ref.name).await?.filter(LogSet::is_ready))
}

fn dnset_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        kind: "DNSet".to_string(),
    })
}

/// Reads the `Ready` condition of an untyped object
pub fn dynamic_object_ready(obj: &DynamicObject) -> bool {
    obj.data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

/// DN sets are managed elsewhere; readiness is read through the dynamic API
pub async fn dnset_ready(client: &Client, default_ns: &str, dnset_ref: &ObjectRef) -> Result<bool> {
    let ar = dnset_api_resource();
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), dnset_ref.namespace_or(default_ns), &ar);
    Ok(api.get_opt(&dnset_ref.name).await?.is_some_and(|o| dynamic_object_ready(&o)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_ready_condition() {
        let mut obj = DynamicObject::new("dn", &dnset_api_resource());
        assert!(!dynamic_object_ready(&obj));
        obj.data = json!({"status": {"conditions": [
            {"type": "Synced", "status": "True"},
            {"type": "Ready", "status": "False"}
        ]}});
        assert!(!dynamic_object_ready(&obj));
        obj.data = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert!(dynamic_object_ready(&obj));
    }
}
