use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_PROVISIONED: &str = "Provisioned";
pub const CONDITION_SCHEDULED: &str = "Scheduled";
pub const CONDITION_READY: &str = "Ready";

pub const REASON_PODS_NOT_READY: &str = "PodsNotReady";
pub const REASON_PODS_READY: &str = "PodsReady";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_NO_DATAPLANE: &str = "NoDataplane";
pub const REASON_SCHEDULED: &str = "Scheduled";
pub const REASON_READY: &str = "Ready";
pub const REASON_PENDING: &str = "Pending";

/// Upper bound on Gateway status conditions accepted by the Gateway API schema
pub const MAX_GATEWAY_CONDITIONS: usize = 8;

pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_owned(),
        status: if status { "True" } else { "False" }.to_owned(),
        reason: reason.to_owned(),
        message: message.into(),
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True if the condition is True and was observed for `generation`
pub fn is_true_for(conditions: &[Condition], type_: &str, generation: Option<i64>) -> bool {
    find(conditions, type_)
        .is_some_and(|c| c.status == "True" && c.observed_generation == generation)
}

fn same(a: &Condition, b: &Condition) -> bool {
    a.type_ == b.type_
        && a.status == b.status
        && a.reason == b.reason
        && a.message == b.message
        && a.observed_generation == b.observed_generation
}

/// Replace the entry of the same type, or append one.
///
/// The transition time is carried over while the status does not change.
/// Returns true if the list changed and needs persisting.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    let mut matching = conditions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.type_ == condition.type_)
        .map(|(i, _)| i);
    let Some(first) = matching.next() else {
        conditions.push(condition);
        return true;
    };
    let has_duplicates = matching.next().is_some();

    let current = &conditions[first];
    if !has_duplicates && same(current, &condition) {
        return false;
    }
    if current.status == condition.status {
        condition.last_transition_time = current.last_transition_time.clone();
    }
    let type_ = condition.type_.clone();
    conditions[first] = condition;
    let mut seen = false;
    conditions.retain(|c| {
        if c.type_ != type_ {
            return true;
        }
        let keep = !seen;
        seen = true;
        keep
    });
    true
}

/// Drop duplicate entries (keeping the latest of each type) and cap the list
/// at `max` entries, keeping `Scheduled` and the most recent others.
/// Returns true if anything was removed.
pub fn prune(conditions: &mut Vec<Condition>, max: usize) -> bool {
    let before = conditions.len();

    let mut deduped: Vec<Condition> = Vec::with_capacity(conditions.len());
    for condition in conditions.drain(..).rev() {
        if !deduped.iter().any(|c| c.type_ == condition.type_) {
            deduped.push(condition);
        }
    }
    deduped.reverse();

    while deduped.len() > max {
        match deduped.iter().position(|c| c.type_ != CONDITION_SCHEDULED) {
            Some(oldest) => {
                deduped.remove(oldest);
            }
            None => break,
        }
    }

    *conditions = deduped;
    conditions.len() != before
}
