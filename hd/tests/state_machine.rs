//! Property tests over the task state machine

use proptest::prelude::*;

use hivedaemon::TaskStatus;

const ALL_STATUSES: [TaskStatus; 9] = [
    TaskStatus::Draft,
    TaskStatus::Pending,
    TaskStatus::Blocked,
    TaskStatus::InProgress,
    TaskStatus::Validating,
    TaskStatus::Failed,
    TaskStatus::Stale,
    TaskStatus::Completed,
    TaskStatus::Cancelled,
];

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    (0..ALL_STATUSES.len()).prop_map(|i| ALL_STATUSES[i])
}

proptest! {
    // Completion is only reachable through validation
    #[test]
    fn completed_only_from_validating(from in status_strategy()) {
        if from.can_transition(TaskStatus::Completed) {
            prop_assert_eq!(from, TaskStatus::Validating);
        }
    }

    // Cancelled is terminal: no outgoing edges at all
    #[test]
    fn cancelled_is_terminal(to in status_strategy()) {
        prop_assert!(!TaskStatus::Cancelled.can_transition(to));
    }

    // No status transitions to itself
    #[test]
    fn no_self_transitions(status in status_strategy()) {
        prop_assert!(!status.can_transition(status));
    }

    // Random legal walks from draft: in_progress is always entered from
    // pending, and completed always follows validating.
    #[test]
    fn random_walks_respect_ordering(choices in proptest::collection::vec(0..ALL_STATUSES.len(), 1..40)) {
        let mut current = TaskStatus::Draft;
        let mut previous = None;

        for choice in choices {
            let next = ALL_STATUSES[choice];
            if current.can_transition(next) {
                if next == TaskStatus::Completed {
                    prop_assert_eq!(current, TaskStatus::Validating);
                }
                if next == TaskStatus::InProgress {
                    prop_assert_eq!(current, TaskStatus::Pending);
                }
                previous = Some(current);
                current = next;
            }
        }
        let _ = previous;
    }
}
