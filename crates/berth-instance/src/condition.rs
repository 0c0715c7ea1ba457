//! Instance and task conditions.
//!
//! Tasks carry a single condition; instances aggregate the conditions of
//! all their tasks. Aggregation is deterministic: identical task sets always
//! produce the same instance condition.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle condition of a task or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Created,
    Reserved,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unreachable,
    Unknown,
}

/// Aggregation priority when tasks disagree: any task in one of these
/// conditions dominates the instance.
const DOMINANT: [Condition; 9] = [
    Condition::Error,
    Condition::Failed,
    Condition::Gone,
    Condition::Dropped,
    Condition::Unreachable,
    Condition::Killing,
    Condition::Starting,
    Condition::Staging,
    Condition::Unknown,
];

/// Fallback priority for the remaining conditions.
const FALLBACK: [Condition; 5] = [
    Condition::Created,
    Condition::Reserved,
    Condition::Running,
    Condition::Finished,
    Condition::Killed,
];

impl Condition {
    /// Terminal conditions expunge the task from the tracker.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
        )
    }

    /// Conditions that count towards "already launched" for scaling.
    pub fn is_launched(self) -> bool {
        matches!(
            self,
            Condition::Created
                | Condition::Running
                | Condition::Staging
                | Condition::Starting
                | Condition::Killing
        )
    }

    /// Scale-down victim candidates, in kill-priority order.
    pub fn scale_down_rank(self) -> Option<u8> {
        match self {
            Condition::Staging => Some(0),
            Condition::Starting => Some(1),
            Condition::Running => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Aggregate task conditions into one instance condition.
///
/// If all tasks agree, that condition wins. Otherwise the first dominant
/// condition found in any task wins, then the first fallback condition.
pub fn aggregate(conditions: &[Condition]) -> Condition {
    match conditions.first() {
        None => return Condition::Unknown,
        Some(first) if conditions.iter().all(|c| c == first) => return *first,
        Some(_) => {}
    }
    for candidate in DOMINANT {
        if conditions.contains(&candidate) {
            return candidate;
        }
    }
    for candidate in FALLBACK {
        if conditions.contains(&candidate) {
            return candidate;
        }
    }
    warn!(?conditions, "no aggregate condition matched");
    Condition::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanimous_tasks_keep_their_condition() {
        assert_eq!(
            aggregate(&[Condition::Running, Condition::Running]),
            Condition::Running
        );
        assert_eq!(aggregate(&[Condition::Reserved]), Condition::Reserved);
    }

    #[test]
    fn dominant_conditions_win_in_priority_order() {
        assert_eq!(
            aggregate(&[Condition::Running, Condition::Failed, Condition::Staging]),
            Condition::Failed
        );
        assert_eq!(
            aggregate(&[Condition::Staging, Condition::Unreachable]),
            Condition::Unreachable
        );
        assert_eq!(
            aggregate(&[Condition::Running, Condition::Staging]),
            Condition::Staging
        );
        // Error outranks everything.
        assert_eq!(
            aggregate(&[Condition::Unreachable, Condition::Error, Condition::Killing]),
            Condition::Error
        );
    }

    #[test]
    fn fallback_conditions_apply_when_no_dominant_matches() {
        assert_eq!(
            aggregate(&[Condition::Running, Condition::Finished]),
            Condition::Running
        );
        assert_eq!(
            aggregate(&[Condition::Killed, Condition::Finished]),
            Condition::Finished
        );
    }

    #[test]
    fn aggregation_is_stable() {
        let tasks = [Condition::Running, Condition::Staging, Condition::Killed];
        assert_eq!(aggregate(&tasks), aggregate(&tasks));
    }

    #[test]
    fn empty_task_set_is_unknown() {
        assert_eq!(aggregate(&[]), Condition::Unknown);
    }

    #[test]
    fn terminal_and_launched_sets() {
        assert!(Condition::Failed.is_terminal());
        assert!(!Condition::Unreachable.is_terminal());
        assert!(Condition::Killing.is_launched());
        assert!(!Condition::Unreachable.is_launched());
        assert_eq!(Condition::Staging.scale_down_rank(), Some(0));
        assert_eq!(Condition::Killing.scale_down_rank(), None);
    }
}
