//! Log store records derived from pod readiness, and the failover decision.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use crate::api::v1alpha1::{LogStore, StorePhase};
use crate::util::{hash::store_uuid, status::is_pod_ready};

/// One record per expected ordinal; a missing or unready pod is Down.
///
/// The transition time of a record only moves when its phase flips.
pub fn store_records(
    pod_names: &[String],
    pods: &[Pod],
    namespace: &str,
    previous: &[LogStore],
    now: DateTime<Utc>,
) -> Vec<LogStore> {
    pod_names
        .iter()
        .map(|pod_name| {
            let up = pods
                .iter()
                .find(|p| &p.name_any() == pod_name)
                .is_some_and(|p| p.metadata.deletion_timestamp.is_none() && is_pod_ready(p));
            let phase = if up { StorePhase::Up } else { StorePhase::Down };
            let last_transition_time = previous
                .iter()
                .find(|s| &s.pod_name == pod_name && s.phase == phase)
                .map(|s| s.last_transition_time.clone())
                .unwrap_or(Time(now));
            LogStore {
                pod_name: pod_name.clone(),
                uuid: store_uuid(pod_name, namespace),
                phase,
                last_transition_time,
            }
        })
        .collect()
}

pub fn up_count(stores: &[LogStore]) -> i32 {
    stores.iter().filter(|s| s.phase == StorePhase::Up).count() as i32
}

/// The first store that has been Down for longer than `timeout`
pub fn failover_candidate(stores: &[LogStore], timeout: chrono::Duration, now: DateTime<Utc>) -> Option<&LogStore> {
    stores
        .iter()
        .find(|s| s.phase == StorePhase::Down && now - s.last_transition_time.0 > timeout)
}

/// Restarts the failure clock of an evicted store so it is evicted only once per timeout
pub fn reset_clock(stores: &mut [LogStore], pod_name: &str, now: DateTime<Utc>) {
    if let Some(store) = stores.iter_mut().find(|s| s.pod_name == pod_name) {
        store.last_transition_time = Time(now);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::api::ObjectMeta;

    use super::*;

    fn pod(name: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn names() -> Vec<String> {
        (0..3).map(|i| format!("mo-log-{i}")).collect()
    }

    #[test]
    fn missing_and_unready_pods_are_down() {
        let now = Utc::now();
        let stores = store_records(&names(), &[pod("mo-log-0", true), pod("mo-log-1", false)], "default", &[], now);
        assert_eq!(stores.len(), 3);
        assert_eq!(stores[0].phase, StorePhase::Up);
        assert_eq!(stores[1].phase, StorePhase::Down);
        assert_eq!(stores[2].phase, StorePhase::Down);
        assert_eq!(up_count(&stores), 1);
        assert_eq!(stores[0].uuid, store_uuid("mo-log-0", "default"));
    }

    #[test]
    fn transition_time_is_kept_while_phase_holds() {
        let t0 = Utc::now() - chrono::Duration::minutes(20);
        let first = store_records(&names(), &[pod("mo-log-0", true)], "default", &[], t0);
        let later = Utc::now();
        let second = store_records(&names(), &[pod("mo-log-0", false)], "default", &first, later);
        assert_eq!(second[0].last_transition_time.0, later);
        assert_eq!(second[1].last_transition_time.0, t0);
    }

    #[test]
    fn one_eviction_per_timeout() {
        let t0 = Utc::now() - chrono::Duration::minutes(11);
        let pods = [pod("mo-log-0", true), pod("mo-log-1", true)];
        let mut stores = store_records(&names(), &pods, "default", &[], t0);
        let timeout = chrono::Duration::minutes(10);
        let now = Utc::now();

        let victim = failover_candidate(&stores, timeout, now).map(|s| s.pod_name.clone());
        assert_eq!(victim.as_deref(), Some("mo-log-2"));

        reset_clock(&mut stores, "mo-log-2", now);
        assert!(failover_candidate(&stores, timeout, now).is_none());
    }
}
