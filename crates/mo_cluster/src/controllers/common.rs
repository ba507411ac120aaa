//! Pieces shared by the workload-rendering controllers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    SecretKeySelector, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::api::v1alpha1::{
    common::{SharedStorageProvider, Volume},
    CNPodPhase, CN_POD_PHASE_LABEL, COMPONENT_LABEL, INSTANCE_LABEL,
};
use crate::util::{
    hash::data_hash,
    status::{find_status_condition, CONDITION_READY},
};

/// Hash of the desired spec, compared instead of diffing server-defaulted fields
pub const SPEC_HASH_ANNO: &str = "matrixorigin.io/spec-hash";

pub const CONFIG_FILE: &str = "config.toml";
pub const START_SCRIPT: &str = "start.sh";
pub const CONFIG_MOUNT: &str = "/etc/matrixone/config";
pub const DATA_MOUNT: &str = "/var/lib/matrixone";
pub const DATA_VOLUME: &str = "data";
pub const CONFIG_VOLUME: &str = "config";

pub fn labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), component.to_string()),
        (INSTANCE_LABEL.to_string(), instance.to_string()),
    ])
}

pub fn selector(component: &str, instance: &str) -> String {
    format!("{COMPONENT_LABEL}={component},{INSTANCE_LABEL}={instance}")
}

pub fn spec_hash<T: Serialize>(obj: &T) -> String {
    let raw = serde_json::to_vec(obj).unwrap_or_default();
    hex::encode(Sha256::digest(&raw))[..16].to_string()
}

/// True when `existing` was rendered from a different desired spec
pub fn needs_update<K: ResourceExt>(existing: &K, desired_hash: &str) -> bool {
    existing.annotations().get(SPEC_HASH_ANNO).map(String::as_str) != Some(desired_hash)
}

pub fn with_spec_hash(mut meta: ObjectMeta, hash: String) -> ObjectMeta {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNO.to_string(), hash);
    meta
}

/// Phase label of a CN pod; pods without one are still starting
pub fn pod_phase(pod: &Pod) -> CNPodPhase {
    pod.labels()
        .get(CN_POD_PHASE_LABEL)
        .map(|p| CNPodPhase::parse(p))
        .unwrap_or_default()
}

/// True when `Ready=False` with this reason and message is already recorded
pub fn reported_not_ready(conditions: &[Condition], reason: &str, message: &str) -> bool {
    find_status_condition(conditions, CONDITION_READY)
        .is_some_and(|c| c.status == "False" && c.reason == reason && c.message == message)
}

/// A config map named after its content: `<owner>-config-<hash>`
pub fn hashed_config_map(
    owner: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{owner}-config-{}", data_hash(&data))),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Config maps of an owner that are no longer mounted
pub fn stale_config_maps(config_maps: &[ConfigMap], owner: &str, current: &str) -> Vec<String> {
    let prefix = format!("{owner}-config-");
    config_maps
        .iter()
        .map(|cm| cm.name_any())
        .filter(|name| name.starts_with(&prefix) && name != current)
        .collect()
}

pub fn volume_claim(name: &str, volume: &Volume) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: volume.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), volume.size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `[[fileservice]]` entries for local, shared and ETL storage
pub fn fileservice_config(storage: &SharedStorageProvider) -> toml::Value {
    let mut local = toml::Table::new();
    local.insert("name".to_string(), "LOCAL".into());
    local.insert("backend".to_string(), "DISK".into());
    local.insert("data-dir".to_string(), format!("{DATA_MOUNT}/data").into());

    let shared = match (&storage.s3, &storage.file_system) {
        (Some(s3), _) => {
            let mut s3_table = toml::Table::new();
            s3_table.insert("bucket".to_string(), s3.bucket().into());
            s3_table.insert("key-prefix".to_string(), s3.prefix().into());
            if let Some(endpoint) = &s3.endpoint {
                s3_table.insert("endpoint".to_string(), endpoint.as_str().into());
            }
            if let Some(region) = &s3.region {
                s3_table.insert("region".to_string(), region.as_str().into());
            }
            let mut t = toml::Table::new();
            t.insert("name".to_string(), "SHARED".into());
            t.insert("backend".to_string(), s3_backend(s3.type_).into());
            t.insert("s3".to_string(), toml::Value::Table(s3_table));
            t
        }
        (None, Some(fs)) => {
            let mut t = toml::Table::new();
            t.insert("name".to_string(), "SHARED".into());
            t.insert("backend".to_string(), "DISK".into());
            t.insert("data-dir".to_string(), fs.path.as_str().into());
            t
        }
        (None, None) => toml::Table::new(),
    };

    let mut etl = shared.clone();
    etl.insert("name".to_string(), "ETL".into());

    toml::Value::Array(vec![
        toml::Value::Table(local),
        toml::Value::Table(shared),
        toml::Value::Table(etl),
    ])
}

fn s3_backend(t: crate::api::v1alpha1::common::S3ProviderType) -> &'static str {
    match t {
        crate::api::v1alpha1::common::S3ProviderType::Aws => "S3",
        crate::api::v1alpha1::common::S3ProviderType::Minio => "MINIO",
    }
}

/// Credentials of the S3 provider, plus the pod identity every start script needs
pub fn process_env(storage: &SharedStorageProvider) -> Vec<EnvVar> {
    let mut env = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("NAMESPACE", "metadata.namespace"),
        field_env("POD_IP", "status.podIP"),
    ];
    if let Some(secret) = storage.s3.as_ref().and_then(|s3| s3.secret_ref.as_ref()) {
        for key in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
            env.push(EnvVar {
                name: key.to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret.clone(),
                        key: key.to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }
    env
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Substituted by the start script with the store UUID
pub const UUID_PLACEHOLDER: &str = "${UUID}";
/// Substituted by the start script with the pod IP
pub const POD_IP_PLACEHOLDER: &str = "${POD_IP}";

/// Start script shared by every database process.
///
/// The store UUID is the first 16 bytes of `sha256("<pod>.<ns>.svc")`, so a
/// restarted pod keeps its HAKeeper identity.
pub fn start_script(service_type: &str, extra_args: &[String]) -> String {
    let args = extra_args.join(" ");
    format!(
        r#"#!/bin/sh
set -eu

UUID=$(printf '%s' "${{POD_NAME}}.${{NAMESPACE}}.svc" | sha256sum | cut -c1-32 | sed -E 's/^(.{{8}})(.{{4}})(.{{4}})(.{{4}})(.{{12}})$/\1-\2-\3-\4-\5/')
CONF={DATA_MOUNT}/runtime.toml
sed -e "s/\${{UUID}}/${{UUID}}/g" -e "s/\${{POD_IP}}/${{POD_IP}}/g" {CONFIG_MOUNT}/{CONFIG_FILE} > "${{CONF}}"

echo "starting {service_type} store ${{UUID}}"
exec /mo-service -cfg "${{CONF}}" {args}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::common::{FileSystemProvider, S3Provider};

    #[test]
    fn config_map_name_follows_content() {
        let a = hashed_config_map("mo-log", "default", BTreeMap::new(), BTreeMap::from([("a".into(), "1".into())]));
        let b = hashed_config_map("mo-log", "default", BTreeMap::new(), BTreeMap::from([("a".into(), "2".into())]));
        assert!(a.name_any().starts_with("mo-log-config-"));
        assert_ne!(a.name_any(), b.name_any());
        assert_eq!(stale_config_maps(&[a.clone(), b.clone()], "mo-log", &a.name_any()), vec![b.name_any()]);
    }

    #[test]
    fn s3_fileservice() {
        let storage = SharedStorageProvider {
            s3: Some(S3Provider {
                path: "mo-bucket/cluster-a".to_string(),
                region: Some("us-west-2".to_string()),
                ..Default::default()
            }),
            file_system: None,
        };
        let fs = fileservice_config(&storage);
        let entries = fs.as_array().unwrap();
        assert_eq!(entries[1]["backend"].as_str(), Some("S3"));
        assert_eq!(entries[1]["s3"]["bucket"].as_str(), Some("mo-bucket"));
        assert_eq!(entries[1]["s3"]["key-prefix"].as_str(), Some("cluster-a"));
        assert_eq!(entries[2]["name"].as_str(), Some("ETL"));
    }

    #[test]
    fn filesystem_fileservice_has_no_credentials() {
        let storage = SharedStorageProvider {
            file_system: Some(FileSystemProvider {
                path: "/test".to_string(),
            }),
            s3: None,
        };
        assert_eq!(fileservice_config(&storage).as_array().unwrap()[1]["data-dir"].as_str(), Some("/test"));
        assert_eq!(process_env(&storage).len(), 3);
    }

    #[test]
    fn start_script_derives_uuid() {
        let script = start_script("cn", &["-debug-http=:6060".to_string()]);
        assert!(script.contains("sha256sum | cut -c1-32"));
        assert!(script.contains(r#"s/\${UUID}/${UUID}/g"#));
        assert!(script.ends_with("-debug-http=:6060\n"));
    }
}
