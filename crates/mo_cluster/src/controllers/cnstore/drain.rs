//! Decides the next step of taking a CN store out of service.
//!
//! A drain first flips the store to `Draining` in HAKeeper so the proxy moves
//! connections away, waits for the store score to reach zero, then (on versions
//! that support it) migrates lock tables to other stores before the pod may go.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::stats::StoreScore;
use crate::api::v1alpha1::{DIAGNOSIS_DRAINING_ANNO, LOCK_RESTART_SET_ANNO, STORE_DRAINING_START_ANNO};
use crate::hakeeper::WorkState;

/// After this long a drain starts dumping the sessions that keep it alive
pub const TAKING_LONG: Duration = Duration::from_secs(5 * 60);

/// Annotations that only exist while a drain is in progress
pub const DRAIN_ANNOTATIONS: [&str; 3] = [STORE_DRAINING_START_ANNO, DIAGNOSIS_DRAINING_ANNO, LOCK_RESTART_SET_ANNO];

/// The store as HAKeeper last reported it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    /// The store cache has not been filled yet
    Unknown,
    Missing,
    Registered(WorkState),
}

#[derive(Clone, Debug)]
pub struct DrainInput {
    pub now: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub timeout: Duration,
    pub min_delay: Duration,
    /// The store readiness condition of the pod is True
    pub ready: bool,
    pub store: StoreState,
    pub score: Option<StoreScore>,
    pub lock_migration: bool,
    pub diagnosed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainStep {
    SetNotReady,
    MarkStart,
    ForceComplete,
    /// `PatchCNStore(uuid, Draining)`
    Cordon,
    Diagnose,
    Wait(Duration, String),
    MigrateLocks,
    Complete,
}

const WAIT_WORKLOAD: Duration = Duration::from_secs(5);

pub fn drain_started(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.annotations()
        .get(STORE_DRAINING_START_ANNO)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub fn has_drain_annotations(pod: &Pod) -> bool {
    DRAIN_ANNOTATIONS.iter().any(|k| pod.annotations().contains_key(*k))
}

/// Merge-patch values removing every drain annotation
pub fn clear_drain_annotations() -> BTreeMap<String, Option<String>> {
    DRAIN_ANNOTATIONS.iter().map(|k| (k.to_string(), None)).collect()
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

pub fn next_drain_step(input: &DrainInput) -> DrainStep {
    if input.ready {
        return DrainStep::SetNotReady;
    }
    let Some(started) = input.started else {
        return DrainStep::MarkStart;
    };
    let draining_for = elapsed(input.now, started);
    if draining_for > input.timeout {
        return DrainStep::ForceComplete;
    }

    match input.store {
        StoreState::Unknown => {
            return DrainStep::Wait(WAIT_WORKLOAD, "store cache is not filled yet".to_string());
        }
        StoreState::Missing => return DrainStep::Complete,
        StoreState::Registered(WorkState::Working) => return DrainStep::Cordon,
        StoreState::Registered(WorkState::Draining) => {}
    }

    if draining_for > TAKING_LONG && !input.diagnosed {
        return DrainStep::Diagnose;
    }
    match input.score {
        None => return DrainStep::Wait(WAIT_WORKLOAD, "store workload is unknown".to_string()),
        Some(score) if !score.is_zero() => {
            return DrainStep::Wait(
                WAIT_WORKLOAD,
                format!(
                    "waiting for {} sessions, {} pipelines and {} replicas to move",
                    score.session_count, score.pipeline_count, score.replica_count
                ),
            );
        }
        Some(_) => {}
    }
    if draining_for < input.min_delay {
        return DrainStep::Wait(input.min_delay - draining_for, "waiting for routers to observe the drain".to_string());
    }
    if input.lock_migration {
        return DrainStep::MigrateLocks;
    }
    DrainStep::Complete
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStep {
    Complete,
    /// Ask the TN to move the store's lock tables
    RequestRestart,
    /// The TN accepted the request, transactions are still running
    Wait,
}

/// `requested` is true once the TN has accepted a restart request for the store
pub fn lock_migration_step(can_restart: bool, requested: bool) -> LockStep {
    match (can_restart, requested) {
        (true, _) => LockStep::Complete,
        (false, false) => LockStep::RequestRestart,
        (false, true) => LockStep::Wait,
    }
}

/// Annotations recording an accepted restart request. A refused request records
/// nothing so the next pass asks again.
pub fn restart_annotations(accepted: bool) -> Option<BTreeMap<String, Option<String>>> {
    accepted.then(|| BTreeMap::from([(LOCK_RESTART_SET_ANNO.to_string(), Some("true".to_string()))]))
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    fn input(now: DateTime<Utc>) -> DrainInput {
        DrainInput {
            now,
            started: Some(now - chrono::Duration::seconds(60)),
            timeout: Duration::from_secs(30 * 60),
            min_delay: Duration::from_secs(15),
            ready: false,
            store: StoreState::Registered(WorkState::Draining),
            score: Some(StoreScore::default()),
            lock_migration: false,
            diagnosed: false,
        }
    }

    #[test]
    fn drain_proceeds_in_order() {
        let now = Utc::now();
        let mut i = input(now);
        i.ready = true;
        i.started = None;
        i.store = StoreState::Registered(WorkState::Working);
        assert_eq!(next_drain_step(&i), DrainStep::SetNotReady);

        i.ready = false;
        assert_eq!(next_drain_step(&i), DrainStep::MarkStart);

        i.started = Some(now);
        assert_eq!(next_drain_step(&i), DrainStep::Cordon);

        i.store = StoreState::Registered(WorkState::Draining);
        i.score = Some(StoreScore {
            session_count: 2,
            ..Default::default()
        });
        assert!(matches!(next_drain_step(&i), DrainStep::Wait(_, msg) if msg.contains("2 sessions")));

        i.score = Some(StoreScore::default());
        assert!(matches!(next_drain_step(&i), DrainStep::Wait(d, _) if d == Duration::from_secs(15)));

        i.started = Some(now - chrono::Duration::seconds(16));
        assert_eq!(next_drain_step(&i), DrainStep::Complete);

        i.lock_migration = true;
        assert_eq!(next_drain_step(&i), DrainStep::MigrateLocks);
    }

    #[test]
    fn timeout_forces_completion() {
        let now = Utc::now();
        let mut i = input(now);
        i.started = Some(now - chrono::Duration::minutes(31));
        i.score = Some(StoreScore {
            session_count: 5,
            ..Default::default()
        });
        assert_eq!(next_drain_step(&i), DrainStep::ForceComplete);
    }

    #[test]
    fn missing_store_completes_drain() {
        let mut i = input(Utc::now());
        i.store = StoreState::Missing;
        i.score = None;
        assert_eq!(next_drain_step(&i), DrainStep::Complete);

        i.store = StoreState::Unknown;
        assert!(matches!(next_drain_step(&i), DrainStep::Wait(..)));
    }

    #[test]
    fn long_drain_is_diagnosed_once() {
        let now = Utc::now();
        let mut i = input(now);
        i.started = Some(now - chrono::Duration::minutes(6));
        i.score = Some(StoreScore {
            pipeline_count: 1,
            ..Default::default()
        });
        assert_eq!(next_drain_step(&i), DrainStep::Diagnose);
        i.diagnosed = true;
        assert!(matches!(next_drain_step(&i), DrainStep::Wait(..)));
    }

    #[test]
    fn drain_annotations() {
        let now = Utc::now();
        let pod = Pod {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(
                    STORE_DRAINING_START_ANNO.to_string(),
                    now.to_rfc3339(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(has_drain_annotations(&pod));
        assert_eq!(drain_started(&pod).map(|t| t.timestamp()), Some(now.timestamp()));
        assert!(clear_drain_annotations().values().all(Option::is_none));
        assert!(!has_drain_annotations(&Pod::default()));
    }

    #[test]
    fn lock_restart_is_requested_until_accepted() {
        assert_eq!(lock_migration_step(false, false), LockStep::RequestRestart);
        assert_eq!(restart_annotations(false), None);
        // refused: the annotation stays absent so the request is repeated
        assert_eq!(lock_migration_step(false, false), LockStep::RequestRestart);

        let accepted = restart_annotations(true).unwrap();
        assert_eq!(accepted[LOCK_RESTART_SET_ANNO].as_deref(), Some("true"));
        assert_eq!(lock_migration_step(false, true), LockStep::Wait);
        assert_eq!(lock_migration_step(true, true), LockStep::Complete);
        assert_eq!(lock_migration_step(true, false), LockStep::Complete);
    }
}
