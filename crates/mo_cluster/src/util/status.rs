use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_READY: &str = "Ready";

/// Builds a condition; `last_transition_time` is filled in by [`set_status_condition`]
pub fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation,
    }
}

/// Sets the corresponding condition in conditions to new_condition and returns
/// a tuple containing the new conditions vector and whether it was changed.
///
/// LastTransitionTime only moves when the status flips, so re-applying an
/// identical condition reports no change.
pub fn set_status_condition(conditions: &[Condition], mut new_condition: Condition) -> (Vec<Condition>, bool) {
    let mut new_conditions = Vec::from(conditions);

    let Some(existing) = new_conditions.iter_mut().find(|c| c.type_ == new_condition.type_) else {
        new_condition.last_transition_time = Time(Utc::now());
        new_conditions.push(new_condition);
        return (new_conditions, true);
    };

    let mut changed = false;
    if existing.status != new_condition.status {
        existing.status = new_condition.status;
        existing.last_transition_time = Time(Utc::now());
        changed = true;
    }
    if existing.reason != new_condition.reason {
        existing.reason = new_condition.reason;
        changed = true;
    }
    if existing.message != new_condition.message {
        existing.message = new_condition.message;
        changed = true;
    }
    if existing.observed_generation != new_condition.observed_generation {
        existing.observed_generation = new_condition.observed_generation;
        changed = true;
    }
    (new_conditions, changed)
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_status_condition(conditions, condition_type).is_some_and(|c| c.status == "True")
}

/// Returns true when the condition_type is present and carries `reason`
pub fn has_condition_reason(conditions: &[Condition], condition_type: &str, reason: &str) -> bool {
    find_status_condition(conditions, condition_type).is_some_and(|c| c.reason == reason)
}

/// Pod-level counterpart used for readiness gates
pub fn pod_condition<'a>(pod: &'a Pod, condition_type: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == condition_type))
}

pub fn is_pod_condition_true(pod: &Pod, condition_type: &str) -> bool {
    pod_condition(pod, condition_type).is_some_and(|c| c.status == "True")
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    is_pod_condition_true(pod, "Ready")
}

/// Returns the pod conditions with `condition_type` set to `status`, or None when already in that state
pub fn set_pod_condition(pod: &Pod, condition_type: &str, status: bool, reason: &str) -> Option<Vec<PodCondition>> {
    let status = if status { "True" } else { "False" };
    let mut conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    match conditions.iter_mut().find(|c| c.type_ == condition_type) {
        Some(c) if c.status == status => return None,
        Some(c) => {
            c.status = status.to_string();
            c.reason = Some(reason.to_string());
            c.last_transition_time = Some(Time(Utc::now()));
        }
        None => conditions.push(PodCondition {
            type_: condition_type.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            last_transition_time: Some(Time(Utc::now())),
            ..Default::default()
        }),
    }
    Some(conditions)
}
