use crate::error::{ReconfigError, ReconfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry thresholds for one retryable-error state: after `warning_threshold`
/// consecutive failures a health warning is reported, after `drop_threshold`
/// the replica is dropped or restarted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryThresholds {
    pub warning_threshold: usize,
    pub drop_threshold: usize,
}

impl RetryThresholds {
    pub const fn new(warning_threshold: usize, drop_threshold: usize) -> Self {
        Self {
            warning_threshold,
            drop_threshold,
        }
    }
}

/// Tunables consumed by the reconfiguration engine. All waiting is driven
/// externally (retry timer / next inbound event); durations here only gate
/// decisions made during those re-evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigurationConfig {
    /// Minimum interval between retries of the same pending message to the
    /// failover manager.
    pub per_replica_minimum_interval_between_message_to_fm: Duration,

    /// How long a newly available endpoint may wait for an in-flight
    /// reconfiguration to finish before being published to the failover
    /// manager anyway.
    pub max_wait_before_publish_endpoint_duration: Duration,

    /// How long Phase1 waits for up replicas that have not answered GetLSN
    /// before quorum evaluation may give up on them.
    pub remote_replica_progress_query_wait_duration: Duration,

    /// Reconfigurations running longer than this emit a slow-reconfiguration
    /// health warning.
    pub reconfiguration_health_report_threshold: Duration,

    /// Host API calls slower than this are traced as warnings.
    pub service_reconfiguration_api_trace_warning_threshold: Duration,

    /// Allows Phase3 to be skipped when the PC and CC replica sets are
    /// identical.
    pub enable_phase3_phase4_in_parallel: bool,

    /// Enables deactivation-epoch filtering during primary election.
    pub is_deactivation_info_enabled: bool,

    /// Enables the acknowledged-LSN vs certified-catchup-LSN check when
    /// computing deactivation-epoch eligibility.
    pub is_data_loss_lsn_check_enabled: bool,

    pub replica_open_retry: RetryThresholds,
    pub replica_reopen_retry: RetryThresholds,
    pub replica_close_retry: RetryThresholds,
    pub replica_delete_retry: RetryThresholds,
    pub replica_change_role_at_catchup_retry: RetryThresholds,
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self {
            per_replica_minimum_interval_between_message_to_fm: Duration::from_secs(15),
            max_wait_before_publish_endpoint_duration: Duration::from_secs(30),
            remote_replica_progress_query_wait_duration: Duration::from_secs(30),
            reconfiguration_health_report_threshold: Duration::from_secs(30),
            service_reconfiguration_api_trace_warning_threshold: Duration::from_secs(30),
            enable_phase3_phase4_in_parallel: true,
            is_deactivation_info_enabled: true,
            is_data_loss_lsn_check_enabled: true,
            replica_open_retry: RetryThresholds::new(8, 40),
            replica_reopen_retry: RetryThresholds::new(8, 40),
            replica_close_retry: RetryThresholds::new(8, 40),
            replica_delete_retry: RetryThresholds::new(8, 40),
            replica_change_role_at_catchup_retry: RetryThresholds::new(8, 40),
        }
    }
}

impl ReconfigurationConfig {
    pub fn validate(&self) -> ReconfigResult<()> {
        for (name, t) in [
            ("replica_open_retry", self.replica_open_retry),
            ("replica_reopen_retry", self.replica_reopen_retry),
            ("replica_close_retry", self.replica_close_retry),
            ("replica_delete_retry", self.replica_delete_retry),
            (
                "replica_change_role_at_catchup_retry",
                self.replica_change_role_at_catchup_retry,
            ),
        ] {
            if t.drop_threshold == 0 {
                return Err(ReconfigError::configuration(format!(
                    "{name}: drop_threshold must be non-zero"
                )));
            }
            if t.warning_threshold > t.drop_threshold {
                return Err(ReconfigError::configuration(format!(
                    "{name}: warning_threshold must not exceed drop_threshold"
                )));
            }
        }
        Ok(())
    }
}
