//! Objects rendered for a LogSet: runtime config, services and the stateful set.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::api::v1alpha1::{ports, LogSet, BOOTSTRAP_ANNO, LOGSET_COMPONENT};
use crate::controllers::common::*;
use crate::hakeeper::discovery_address;
use crate::util::{
    config::{dotted_table, render_toml},
    errors::Result,
    hash::store_uuid,
};

/// HAKeeper replica IDs of the initial members start here
pub const HAKEEPER_REPLICA_ID_BASE: i64 = 131072;

pub fn statefulset_name(ls: &LogSet) -> String {
    format!("{}-log", ls.name_any())
}

pub fn pod_name(ls: &LogSet, ordinal: i32) -> String {
    format!("{}-{ordinal}", statefulset_name(ls))
}

/// Claim the stateful set creates for a pod
pub fn pvc_name(pod_name: &str) -> String {
    format!("{DATA_VOLUME}-{pod_name}")
}

fn peer_address(ls: &LogSet, ordinal: i32, port: i32) -> String {
    format!(
        "{}.{}.{}.svc:{port}",
        pod_name(ls, ordinal),
        ls.headless_service_name(),
        ls.namespace().unwrap_or_default()
    )
}

/// `<replica-id>:<store-uuid>` of the stores HAKeeper is bootstrapped with
pub fn initial_members(ls: &LogSet) -> Vec<String> {
    let ns = ls.namespace().unwrap_or_default();
    (0..ls.spec.ha_size())
        .map(|i| {
            format!(
                "{}:{}",
                HAKEEPER_REPLICA_ID_BASE + i as i64,
                store_uuid(&pod_name(ls, i), &ns)
            )
        })
        .collect()
}

/// Runtime config of a log store
pub fn runtime_config(ls: &LogSet) -> Result<String> {
    let spec = &ls.spec;
    let ha = spec.ha_size();
    let seeds: Vec<toml::Value> = (0..ha)
        .map(|i| peer_address(ls, i, ports::LOG_GOSSIP).into())
        .collect();
    let members: Vec<toml::Value> = initial_members(ls).into_iter().map(Into::into).collect();

    let defaults = dotted_table(BTreeMap::from([
        ("log.level", "info".into()),
        ("log.format", "json".into()),
        ("logservice.deployment-id", toml::Value::Integer(1)),
    ]));
    let mut forced = dotted_table(BTreeMap::from([
        ("service-type", "LOG".into()),
        ("data-dir", format!("{DATA_MOUNT}/data").into()),
        ("logservice.uuid", UUID_PLACEHOLDER.into()),
        ("logservice.service-host", POD_IP_PLACEHOLDER.into()),
        ("logservice.logservice-listen-address", format!("0.0.0.0:{}", ports::LOG_SERVICE).into()),
        ("logservice.raft-listen-address", format!("0.0.0.0:{}", ports::LOG_RAFT).into()),
        ("logservice.gossip-listen-address", format!("0.0.0.0:{}", ports::LOG_GOSSIP).into()),
        ("logservice.gossip-seed-addresses", toml::Value::Array(seeds)),
        ("logservice.BootstrapConfig.bootstrap-cluster", true.into()),
        (
            "logservice.BootstrapConfig.num-of-log-shards",
            toml::Value::Integer(spec.initial_config.log_shards.unwrap_or(1) as i64),
        ),
        (
            "logservice.BootstrapConfig.num-of-tn-shards",
            toml::Value::Integer(spec.initial_config.dn_shards.unwrap_or(1) as i64),
        ),
        ("logservice.BootstrapConfig.num-of-log-shard-replicas", toml::Value::Integer(ha as i64)),
        ("logservice.BootstrapConfig.init-hakeeper-members", toml::Value::Array(members)),
        ("hakeeper-client.discovery-address", discovery_address(ls).into()),
    ]));
    forced.insert("fileservice".to_string(), fileservice_config(&spec.shared_storage));

    render_toml(defaults, spec.pod_set.config.as_deref(), forced)
}

pub fn config_map(ls: &LogSet, extra_args: &[String]) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        (CONFIG_FILE.to_string(), runtime_config(ls)?),
        (START_SCRIPT.to_string(), start_script("logservice", extra_args)),
    ]);
    Ok(hashed_config_map(
        &ls.name_any(),
        &ls.namespace().unwrap_or_default(),
        labels(LOGSET_COMPONENT, &ls.name_any()),
        data,
    ))
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service(ls: &LogSet, name: String, spec: ServiceSpec) -> Service {
    let mut service = Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ls.namespace(),
            labels: Some(labels(LOGSET_COMPONENT, &ls.name_any())),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let hash = spec_hash(&service.spec);
    service.metadata = with_spec_hash(service.metadata, hash);
    service
}

/// Headless service for peer discovery and the discovery service HAKeeper clients dial
pub fn services(ls: &LogSet) -> Vec<Service> {
    let selector = labels(LOGSET_COMPONENT, &ls.name_any());
    let headless = service(
        ls,
        ls.headless_service_name(),
        ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector.clone()),
            ports: Some(vec![
                port("logservice", ports::LOG_SERVICE),
                port("raft", ports::LOG_RAFT),
                port("gossip", ports::LOG_GOSSIP),
                port("hakeeper", ports::HAKEEPER),
            ]),
            ..Default::default()
        },
    );
    let discovery = service(
        ls,
        ls.discovery_service_name(),
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![port("hakeeper", ports::HAKEEPER)]),
            ..Default::default()
        },
    );
    vec![headless, discovery]
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// The stateful set running the log stores.
///
/// While `bootstrapping` the replica count is pinned to the HA size and the
/// bootstrap annotation blocks scaling until enough stores are up.
pub fn statefulset(ls: &LogSet, config_map: &str, bootstrapping: bool) -> StatefulSet {
    let spec = &ls.spec;
    let name = statefulset_name(ls);
    let pod_labels = labels(LOGSET_COMPONENT, &ls.name_any());
    let replicas = if bootstrapping {
        spec.ha_size()
    } else {
        spec.pod_set.replicas
    };

    let mut pod_annotations = BTreeMap::new();
    if spec.pod_set.export_to_prometheus.unwrap_or(false) {
        pod_annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        pod_annotations.insert("prometheus.io/port".to_string(), ports::METRICS.to_string());
    }

    let container = Container {
        name: "main".to_string(),
        image: Some(spec.pod_set.image.clone()),
        command: Some(vec![
            "/bin/sh".to_string(),
            format!("{CONFIG_MOUNT}/{START_SCRIPT}"),
        ]),
        env: Some(process_env(&spec.shared_storage)),
        ports: Some(vec![
            container_port("logservice", ports::LOG_SERVICE),
            container_port("hakeeper", ports::HAKEEPER),
            container_port("raft", ports::LOG_RAFT),
            container_port("gossip", ports::LOG_GOSSIP),
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

    let sts_spec = StatefulSetSpec {
        replicas: Some(replicas),
        service_name: Some(ls.headless_service_name()),
        pod_management_policy: Some("Parallel".to_string()),
        selector: LabelSelector {
            match_labels: Some(pod_labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels.clone()),
                annotations: Some(pod_annotations).filter(|a| !a.is_empty()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                node_selector: Some(spec.pod_set.node_selector.clone()).filter(|n| !n.is_empty()),
                volumes: Some(vec![Volume {
                    name: CONFIG_VOLUME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: config_map.to_string(),
                        default_mode: Some(0o755),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
        volume_claim_templates: Some(vec![volume_claim(DATA_VOLUME, &spec.volume)]),
        ..Default::default()
    };

    let mut annotations = BTreeMap::new();
    if bootstrapping {
        annotations.insert(BOOTSTRAP_ANNO.to_string(), "true".to_string());
    }
    let meta = ObjectMeta {
        name: Some(name),
        namespace: ls.namespace(),
        labels: Some(pod_labels),
        annotations: Some(annotations),
        ..Default::default()
    };
    let hash = spec_hash(&sts_spec);
    StatefulSet {
        metadata: with_spec_hash(meta, hash),
        spec: Some(sts_spec),
        ..Default::default()
    }
}

/// True once the stateful set runs the latest template on every replica
pub fn rolled_out(sts: &StatefulSet) -> bool {
    let (Some(spec), Some(status)) = (&sts.spec, &sts.status) else {
        return false;
    };
    let generation_seen = status.observed_generation >= sts.metadata.generation;
    let replicas = spec.replicas.unwrap_or(1);
    generation_seen
        && status.updated_replicas.unwrap_or(0) >= replicas
        && status.current_revision.is_some()
        && status.current_revision == status.update_revision
}

/// Config map mounted by the stateful set's pod template
pub fn mounted_config_map(sts: &StatefulSet) -> Option<String> {
    sts.spec
        .as_ref()?
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
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::api::v1alpha1::{
        common::{FileSystemProvider, PodSet, SharedStorageProvider, Volume as StoreVolume},
        LogSetSpec,
    };

    pub fn logset(replicas: i32) -> LogSet {
        LogSet {
            metadata: ObjectMeta {
                name: Some("mo".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("ls-uid".to_string()),
                ..Default::default()
            },
            spec: LogSetSpec {
                pod_set: PodSet {
                    replicas,
                    image: "matrixorigin/matrixone:1.2.0".to_string(),
                    config: Some("[log]\nlevel = \"debug\"\n".to_string()),
                    ..Default::default()
                },
                volume: StoreVolume {
                    size: Quantity("10Gi".to_string()),
                    storage_class_name: None,
                },
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

    #[test]
    fn runtime_config_forces_operator_keys() {
        let ls = logset(3);
        let rendered: toml::Table = runtime_config(&ls).unwrap().parse().unwrap();
        assert_eq!(rendered["service-type"].as_str(), Some("LOG"));
        assert_eq!(rendered["log"]["level"].as_str(), Some("debug"));
        assert_eq!(
            rendered["hakeeper-client"]["discovery-address"].as_str(),
            Some("mo-discovery.default.svc:32001")
        );
        let bootstrap = &rendered["logservice"]["BootstrapConfig"];
        assert_eq!(bootstrap["num-of-log-shard-replicas"].as_integer(), Some(3));
        let members = bootstrap["init-hakeeper-members"].as_array().unwrap();
        assert_eq!(members.len(), 3);
        assert!(members[0].as_str().unwrap().starts_with("131072:"));
        assert_eq!(rendered["logservice"]["uuid"].as_str(), Some(UUID_PLACEHOLDER));
        assert_eq!(rendered["fileservice"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn bootstrapping_pins_replicas_to_ha_size() {
        let ls = logset(5);
        let sts = statefulset(&ls, "mo-config-abc", true);
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
        assert_eq!(sts.annotations().get(BOOTSTRAP_ANNO).map(String::as_str), Some("true"));

        let settled = statefulset(&ls, "mo-config-abc", false);
        assert_eq!(settled.spec.as_ref().unwrap().replicas, Some(5));
        assert!(!settled.annotations().contains_key(BOOTSTRAP_ANNO));
        assert_ne!(
            settled.annotations().get(SPEC_HASH_ANNO),
            sts.annotations().get(SPEC_HASH_ANNO)
        );
        assert_eq!(mounted_config_map(&settled).as_deref(), Some("mo-config-abc"));
    }

    #[test]
    fn services_cover_peers_and_discovery() {
        let svcs = services(&logset(3));
        assert_eq!(svcs[0].name_any(), "mo-headless");
        assert_eq!(svcs[0].spec.as_ref().unwrap().cluster_ip.as_deref(), Some("None"));
        assert_eq!(svcs[1].name_any(), "mo-discovery");
        assert_eq!(svcs[1].spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 32001);
    }
}
