//! Objects rendered for a CNSet: runtime config, the client service and the CloneSet.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, PodReadinessGate, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::api::v1alpha1::cloneset::{CloneSetScaleStrategy, CloneSetUpdateStrategy, Lifecycle, LifecycleHook};
use crate::api::v1alpha1::{
    ports, CNSet, CloneSet, CloneSetSpec, LogSet, CLUSTER_LABEL, CNSET_COMPONENT, CN_DRAINING_FINALIZER,
    CN_STORE_READINESS,
};
use crate::controllers::common::*;
use crate::hakeeper::discovery_address;
use crate::util::{
    config::{dotted_table, render_toml},
    errors::Result,
};

pub fn cloneset_name(cn: &CNSet) -> String {
    cn.name_any()
}

pub fn pod_labels(cn: &CNSet) -> BTreeMap<String, String> {
    let mut pod_labels = labels(CNSET_COMPONENT, &cn.name_any());
    pod_labels.insert(CLUSTER_LABEL.to_string(), cn.spec.logset_ref.name.clone());
    for (k, v) in &cn.spec.pod_labels {
        pod_labels.entry(k.clone()).or_insert_with(|| v.clone());
    }
    pod_labels
}

fn listen(port: i32) -> toml::Value {
    format!("0.0.0.0:{port}").into()
}

fn advertise(port: i32) -> toml::Value {
    format!("{POD_IP_PLACEHOLDER}:{port}").into()
}

/// Runtime config of a CN store; shared storage follows the LogSet
pub fn runtime_config(cn: &CNSet, ls: &LogSet) -> Result<String> {
    let defaults = dotted_table(BTreeMap::from([
        ("log.level", "info".into()),
        ("log.format", "json".into()),
        ("cn.frontend.unix-socket", "/tmp/mysql.sock".into()),
    ]));
    let mut forced = dotted_table(BTreeMap::from([
        ("service-type", "CN".into()),
        ("data-dir", format!("{DATA_MOUNT}/data").into()),
        ("cn.uuid", UUID_PLACEHOLDER.into()),
        ("cn.role", cn.spec.role.unwrap_or_default().to_string().into()),
        ("cn.listen-address", listen(ports::CN_SERVICE)),
        ("cn.service-address", advertise(ports::CN_SERVICE)),
        ("cn.sql-address", advertise(ports::CN_SQL)),
        ("cn.frontend.port", toml::Value::Integer(ports::CN_SQL as i64)),
        ("cn.pipeline-service-address", advertise(ports::CN_PIPELINE)),
        ("cn.lockservice.listen-address", listen(ports::CN_LOCK_SERVICE)),
        ("cn.lockservice.service-address", advertise(ports::CN_LOCK_SERVICE)),
        ("cn.query-service.listen-address", listen(ports::CN_QUERY)),
        ("cn.query-service.service-address", advertise(ports::CN_QUERY)),
        ("hakeeper-client.discovery-address", discovery_address(ls).into()),
    ]));
    forced.insert("fileservice".to_string(), fileservice_config(&ls.spec.shared_storage));
    render_toml(defaults, cn.spec.pod_set.config.as_deref(), forced)
}

pub fn config_map(cn: &CNSet, ls: &LogSet, extra_args: &[String]) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        (CONFIG_FILE.to_string(), runtime_config(cn, ls)?),
        (START_SCRIPT.to_string(), start_script("cn", extra_args)),
    ]);
    Ok(hashed_config_map(
        &cn.name_any(),
        &cn.namespace().unwrap_or_default(),
        labels(CNSET_COMPONENT, &cn.name_any()),
        data,
    ))
}

/// Client service of the set; type and node port follow the spec
pub fn service(cn: &CNSet) -> Service {
    let spec = ServiceSpec {
        type_: Some(cn.spec.service_type.clone().unwrap_or_else(|| "ClusterIP".to_string())),
        selector: Some(labels(CNSET_COMPONENT, &cn.name_any())),
        ports: Some(vec![ServicePort {
            name: Some("sql".to_string()),
            port: ports::CN_SQL,
            target_port: Some(IntOrString::Int(ports::CN_SQL)),
            node_port: cn.spec.node_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let meta = ObjectMeta {
        name: Some(cn.name_any()),
        namespace: cn.namespace(),
        labels: Some(labels(CNSET_COMPONENT, &cn.name_any())),
        ..Default::default()
    };
    let hash = spec_hash(&spec);
    Service {
        metadata: with_spec_hash(meta, hash),
        spec: Some(spec),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// The CloneSet running the CN stores.
///
/// Pods declare the store readiness gate, and Kruise holds every deletion or
/// in-place update until the draining finalizer is removed.
pub fn cloneset(cn: &CNSet, ls: &LogSet, config_map: &str) -> CloneSet {
    let spec = &cn.spec;
    let mut annotations = BTreeMap::new();
    if spec.pod_set.export_to_prometheus.unwrap_or(false) {
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        annotations.insert("prometheus.io/port".to_string(), ports::METRICS.to_string());
    }

    let container = Container {
        name: "main".to_string(),
        image: Some(spec.pod_set.image.clone()),
        command: Some(vec!["/bin/sh".to_string(), format!("{CONFIG_MOUNT}/{START_SCRIPT}")]),
        env: Some(process_env(&ls.spec.shared_storage)),
        ports: Some(vec![
            container_port("sql", ports::CN_SQL),
            container_port("service", ports::CN_SERVICE),
            container_port("pipeline", ports::CN_PIPELINE),
            container_port("lock", ports::CN_LOCK_SERVICE),
            container_port("query", ports::CN_QUERY),
            container_port("metrics", ports::METRICS),
        ]),
        resources: spec.pod_set.resources.clone(),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut volumes = vec![Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            default_mode: Some(0o755),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let volume_claim_templates = match &spec.cache_volume {
        Some(cache) => vec![volume_claim(DATA_VOLUME, cache)],
        None => {
            volumes.push(Volume {
                name: DATA_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            Vec::new()
        }
    };

    let hook = LifecycleHook {
        finalizers_handler: vec![CN_DRAINING_FINALIZER.to_string()],
    };
    let cs_spec = CloneSetSpec {
        replicas: Some(spec.pod_set.replicas),
        selector: LabelSelector {
            match_labels: Some(labels(CNSET_COMPONENT, &cn.name_any())),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels(cn)),
                annotations: Some(annotations).filter(|a| !a.is_empty()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                readiness_gates: Some(vec![PodReadinessGate {
                    condition_type: CN_STORE_READINESS.to_string(),
                }]),
                node_selector: Some(spec.pod_set.node_selector.clone()).filter(|n| !n.is_empty()),
                volumes: Some(volumes),
                ..Default::default()
            }),
        },
        volume_claim_templates,
        scale_strategy: Some(CloneSetScaleStrategy {
            pods_to_delete: spec.pods_to_delete.clone(),
            max_unavailable: None,
        }),
        update_strategy: Some(CloneSetUpdateStrategy {
            type_: Some("ReCreate".to_string()),
            paused: spec.pause_update,
            max_unavailable: Some(IntOrString::Int(1)),
            max_surge: None,
        }),
        lifecycle: Some(Lifecycle {
            pre_delete: Some(hook.clone()),
            in_place_update: Some(hook),
        }),
        min_ready_seconds: None,
    };

    let meta = ObjectMeta {
        name: Some(cloneset_name(cn)),
        namespace: cn.namespace(),
        labels: Some(labels(CNSET_COMPONENT, &cn.name_any())),
        ..Default::default()
    };
    let hash = spec_hash(&cs_spec);
    CloneSet {
        metadata: with_spec_hash(meta, hash),
        spec: cs_spec,
        status: None,
    }
}

/// True once every replica runs the latest template
pub fn rolled_out(cs: &CloneSet) -> bool {
    let Some(status) = &cs.status else {
        return false;
    };
    status.observed_generation >= cs.metadata.generation.unwrap_or(0)
        && status.updated_replicas >= cs.spec.replicas.unwrap_or(0)
}

pub fn mounted_config_map(cs: &CloneSet) -> Option<String> {
    cs.spec
        .template
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == CONFIG_VOLUME)?
        .config_map
        .as_ref()
        .map(|cm| cm.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{
        common::{FileSystemProvider, ObjectRef, PodSet, SharedStorageProvider},
        CNSetSpec, LogSetSpec, POOL_NAME_LABEL,
    };

    pub fn logset() -> LogSet {
        LogSet {
            metadata: ObjectMeta {
                name: Some("mo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: LogSetSpec {
                shared_storage: SharedStorageProvider {
                    file_system: Some(FileSystemProvider {
                        path: "/test".to_string(),
                    }),
                    s3: None,
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn cnset(name: &str) -> CNSet {
        CNSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CNSetSpec {
                pod_set: PodSet {
                    replicas: 2,
                    image: "matrixorigin/matrixone:1.2.0".to_string(),
                    ..Default::default()
                },
                logset_ref: ObjectRef {
                    name: "mo".to_string(),
                    namespace: None,
                },
                pod_labels: BTreeMap::from([(POOL_NAME_LABEL.to_string(), "pool-a".to_string())]),
                pods_to_delete: vec!["cn-abcde".to_string()],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn cloneset_gates_readiness_and_deletion() {
        let cs = cloneset(&cnset("cn"), &logset(), "cn-config-1");
        let pod = cs.spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.readiness_gates.as_ref().unwrap()[0].condition_type, CN_STORE_READINESS);
        let lifecycle = cs.spec.lifecycle.as_ref().unwrap();
        assert_eq!(
            lifecycle.pre_delete.as_ref().unwrap().finalizers_handler,
            vec![CN_DRAINING_FINALIZER.to_string()]
        );
        assert_eq!(cs.spec.scale_strategy.as_ref().unwrap().pods_to_delete, vec!["cn-abcde".to_string()]);
        let template_labels = cs.spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(template_labels.get(POOL_NAME_LABEL).map(String::as_str), Some("pool-a"));
        assert_eq!(template_labels.get(CLUSTER_LABEL).map(String::as_str), Some("mo"));
        assert!(cs.spec.volume_claim_templates.is_empty());
        assert_eq!(mounted_config_map(&cs).as_deref(), Some("cn-config-1"));
    }

    #[test]
    fn runtime_config_points_at_logset() {
        let rendered: toml::Table = runtime_config(&cnset("cn"), &logset()).unwrap().parse().unwrap();
        assert_eq!(rendered["service-type"].as_str(), Some("CN"));
        assert_eq!(rendered["cn"]["role"].as_str(), Some("TP"));
        assert_eq!(rendered["cn"]["sql-address"].as_str(), Some("${POD_IP}:6001"));
        assert_eq!(
            rendered["hakeeper-client"]["discovery-address"].as_str(),
            Some("mo-discovery.default.svc:32001")
        );
    }

    #[test]
    fn service_carries_node_port() {
        let mut cn = cnset("cn");
        cn.spec.service_type = Some("NodePort".to_string());
        cn.spec.node_port = Some(31001);
        let svc = service(&cn);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap()[0].node_port, Some(31001));
    }
}
