use crate::config::{ReconfigurationConfig, RetryThresholds};
use serde::{Deserialize, Serialize};

/// Which fallible host interaction is currently being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RetryableErrorStateName {
    #[default]
    None,
    ReplicaOpen,
    ReplicaReopen,
    ReplicaClose,
    ReplicaDelete,
    ReplicaChangeRoleAtCatchup,
}

/// Escalation decided after a failure or success was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RetryableErrorAction {
    #[default]
    None,
    /// Keep the replica but restart it (drop for volatile replicas).
    Restart,
    Drop,
    ReportHealthWarning,
    ReportHealthError,
    ClearHealthReport,
}

/// Bounded-retry policy for host transition failures: count consecutive
/// failures per state, report a health warning at the warning threshold and
/// escalate at the drop threshold. Success clears the count and retracts a
/// previously reported warning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryableErrorState {
    current: RetryableErrorStateName,
    failure_count: usize,
    health_reported: bool,
}

impl RetryableErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RetryableErrorStateName {
        self.current
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    pub fn enter_state(&mut self, name: RetryableErrorStateName) {
        self.current = name;
        self.failure_count = 0;
    }

    pub fn reset(&mut self) {
        self.current = RetryableErrorStateName::None;
        self.failure_count = 0;
        self.health_reported = false;
    }

    fn thresholds(&self, config: &ReconfigurationConfig) -> Option<RetryThresholds> {
        match self.current {
            RetryableErrorStateName::None => None,
            RetryableErrorStateName::ReplicaOpen => Some(config.replica_open_retry),
            RetryableErrorStateName::ReplicaReopen => Some(config.replica_reopen_retry),
            RetryableErrorStateName::ReplicaClose => Some(config.replica_close_retry),
            RetryableErrorStateName::ReplicaDelete => Some(config.replica_delete_retry),
            RetryableErrorStateName::ReplicaChangeRoleAtCatchup => {
                Some(config.replica_change_role_at_catchup_retry)
            }
        }
    }

    pub fn on_failure(&mut self, config: &ReconfigurationConfig) -> RetryableErrorAction {
        let Some(thresholds) = self.thresholds(config) else {
            return RetryableErrorAction::None;
        };

        self.failure_count += 1;

        if self.failure_count >= thresholds.drop_threshold {
            return match self.current {
                RetryableErrorStateName::ReplicaOpen
                | RetryableErrorStateName::ReplicaReopen
                | RetryableErrorStateName::ReplicaChangeRoleAtCatchup => {
                    RetryableErrorAction::Restart
                }
                // A closing or deleting replica cannot be dropped harder;
                // keep retrying and escalate the health report.
                RetryableErrorStateName::ReplicaClose | RetryableErrorStateName::ReplicaDelete => {
                    self.health_reported = true;
                    RetryableErrorAction::ReportHealthError
                }
                RetryableErrorStateName::None => RetryableErrorAction::None,
            };
        }

        if self.failure_count == thresholds.warning_threshold {
            self.health_reported = true;
            return RetryableErrorAction::ReportHealthWarning;
        }

        RetryableErrorAction::None
    }

    pub fn on_success_and_transition_to(
        &mut self,
        next: RetryableErrorStateName,
    ) -> RetryableErrorAction {
        let action = if self.health_reported {
            RetryableErrorAction::ClearHealthReport
        } else {
            RetryableErrorAction::None
        };

        self.current = next;
        self.failure_count = 0;
        self.health_reported = false;
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconfigurationConfig {
        let mut config = ReconfigurationConfig::default();
        config.replica_open_retry = RetryThresholds::new(2, 4);
        config.replica_close_retry = RetryThresholds::new(2, 4);
        config
    }

    #[test]
    fn test_warning_then_restart_escalation() {
        let config = config();
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaOpen);

        assert_eq!(state.on_failure(&config), RetryableErrorAction::None);
        assert_eq!(
            state.on_failure(&config),
            RetryableErrorAction::ReportHealthWarning
        );
        assert_eq!(state.on_failure(&config), RetryableErrorAction::None);
        assert_eq!(state.on_failure(&config), RetryableErrorAction::Restart);
    }

    #[test]
    fn test_close_escalates_to_health_error() {
        let config = config();
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaClose);
        for _ in 0..3 {
            state.on_failure(&config);
        }
        assert_eq!(
            state.on_failure(&config),
            RetryableErrorAction::ReportHealthError
        );
    }

    #[test]
    fn test_success_clears_reported_warning() {
        let config = config();
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaOpen);
        state.on_failure(&config);
        state.on_failure(&config); // warning reported

        let action = state.on_success_and_transition_to(RetryableErrorStateName::None);
        assert_eq!(action, RetryableErrorAction::ClearHealthReport);
        assert_eq!(state.current(), RetryableErrorStateName::None);
        assert_eq!(state.failure_count(), 0);
    }

    #[test]
    fn test_success_without_warning_is_silent() {
        let mut state = RetryableErrorState::new();
        state.enter_state(RetryableErrorStateName::ReplicaOpen);
        let action = state.on_success_and_transition_to(RetryableErrorStateName::ReplicaClose);
        assert_eq!(action, RetryableErrorAction::None);
        assert_eq!(state.current(), RetryableErrorStateName::ReplicaClose);
    }

    #[test]
    fn test_failures_in_none_state_are_ignored() {
        let config = config();
        let mut state = RetryableErrorState::new();
        assert_eq!(state.on_failure(&config), RetryableErrorAction::None);
        assert_eq!(state.failure_count(), 0);
    }
}
