use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which report about the local replica is owed to the failover manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FmMessageStage {
    #[default]
    None,
    /// Initial upload of the unit after node start.
    ReplicaUpload,
    ReplicaUp,
    ReplicaDown,
    ReplicaDropped,
    /// A new primary endpoint is ready to be published.
    EndpointAvailable,
}

/// Tracks the single pending failover-manager report for a unit, with retry
/// throttling and a sequence number so late replies can be told apart from
/// replies to the current report.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FmMessageState {
    stage: FmMessageStage,
    sequence_number: i64,
    last_retry_time: Option<DateTime<Utc>>,
    /// Instance the pending ReplicaDown report is about; a down reply for a
    /// different instance is stale.
    down_replica_instance_id: Option<i64>,
}

impl FmMessageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_stage(&self) -> FmMessageStage {
        self.stage
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    fn set_stage(&mut self, stage: FmMessageStage) {
        if self.stage == stage {
            return;
        }
        self.stage = stage;
        self.sequence_number += 1;
        // A fresh report goes out immediately on the next compose.
        self.last_retry_time = None;
        if stage != FmMessageStage::ReplicaDown {
            self.down_replica_instance_id = None;
        }
    }

    /// Local replica opened and is up.
    pub fn on_replica_up(&mut self) {
        self.set_stage(FmMessageStage::ReplicaUp);
    }

    /// Initial upload of the unit is required before anything else is
    /// reported.
    pub fn on_upload_pending(&mut self) {
        self.set_stage(FmMessageStage::ReplicaUpload);
    }

    /// Local replica went down. Volatile replicas cannot come back, so a
    /// down volatile replica is reported as dropped.
    pub fn on_replica_down(&mut self, has_persisted_state: bool, instance_id: i64) {
        if has_persisted_state {
            self.set_stage(FmMessageStage::ReplicaDown);
            self.down_replica_instance_id = Some(instance_id);
        } else {
            self.set_stage(FmMessageStage::ReplicaDropped);
        }
    }

    pub fn on_dropped(&mut self) {
        self.set_stage(FmMessageStage::ReplicaDropped);
    }

    pub fn on_endpoint_available(&mut self) {
        self.set_stage(FmMessageStage::EndpointAvailable);
    }

    pub fn on_replica_up_acknowledged(&mut self) {
        if self.stage == FmMessageStage::ReplicaUp {
            self.set_stage(FmMessageStage::None);
        }
    }

    pub fn on_replica_down_reply(&mut self, instance_id: i64) {
        if self.stage == FmMessageStage::ReplicaDown
            && self.down_replica_instance_id == Some(instance_id)
        {
            self.set_stage(FmMessageStage::None);
        }
    }

    pub fn on_replica_dropped_reply(&mut self) {
        if self.stage == FmMessageStage::ReplicaDropped {
            self.set_stage(FmMessageStage::None);
        }
    }

    pub fn on_endpoint_publish_reply(&mut self) {
        if self.stage == FmMessageStage::EndpointAvailable {
            self.set_stage(FmMessageStage::None);
        }
    }

    /// Post-deserialization fixup: a persisted unit that went down with the
    /// node still owes the failover manager its report.
    pub fn on_loaded_from_store(&mut self, is_open: bool, has_persisted_state: bool, instance_id: i64) {
        if is_open {
            self.on_replica_down(has_persisted_state, instance_id);
        } else if self.stage != FmMessageStage::None {
            // Keep whatever report was pending at the time of the snapshot.
            self.last_retry_time = None;
        }
    }

    pub fn reset(&mut self) {
        self.stage = FmMessageStage::None;
        self.last_retry_time = None;
        self.down_replica_instance_id = None;
    }

    /// Returns the sequence number to stamp on the outgoing message when a
    /// (re)send is due.
    pub fn should_retry(&self, now: DateTime<Utc>, min_interval: Duration) -> Option<i64> {
        if self.stage == FmMessageStage::None {
            return None;
        }
        match self.last_retry_time {
            None => Some(self.sequence_number),
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= min_interval {
                    Some(self.sequence_number)
                } else {
                    None
                }
            }
        }
    }

    pub fn on_retry(&mut self, now: DateTime<Utc>, sequence_number: i64) {
        if sequence_number == self.sequence_number {
            self.last_retry_time = Some(now);
        }
    }
}

impl fmt::Display for FmMessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.stage, self.sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volatile_down_is_reported_as_dropped() {
        let mut state = FmMessageState::new();
        state.on_replica_down(false, 1);
        assert_eq!(state.message_stage(), FmMessageStage::ReplicaDropped);

        let mut state = FmMessageState::new();
        state.on_replica_down(true, 1);
        assert_eq!(state.message_stage(), FmMessageStage::ReplicaDown);
    }

    #[test]
    fn test_down_reply_requires_matching_instance() {
        let mut state = FmMessageState::new();
        state.on_replica_down(true, 5);
        state.on_replica_down_reply(4);
        assert_eq!(state.message_stage(), FmMessageStage::ReplicaDown);
        state.on_replica_down_reply(5);
        assert_eq!(state.message_stage(), FmMessageStage::None);
    }

    #[test]
    fn test_retry_throttling() {
        let mut state = FmMessageState::new();
        state.on_replica_up();

        let t0 = Utc::now();
        let interval = Duration::from_secs(15);

        let seq = state.should_retry(t0, interval);
        assert!(seq.is_some());
        state.on_retry(t0, seq.unwrap());

        // Not due yet.
        assert!(state
            .should_retry(t0 + chrono::Duration::seconds(5), interval)
            .is_none());
        // Due again.
        assert!(state
            .should_retry(t0 + chrono::Duration::seconds(20), interval)
            .is_some());
    }

    #[test]
    fn test_stage_change_resets_throttle_and_bumps_sequence() {
        let mut state = FmMessageState::new();
        state.on_replica_up();
        let seq1 = state.sequence_number();
        state.on_retry(Utc::now(), seq1);

        state.on_dropped();
        assert!(state.sequence_number() > seq1);
        assert!(state
            .should_retry(Utc::now(), Duration::from_secs(3600))
            .is_some());
    }

    #[test]
    fn test_stale_up_acknowledgement_ignored_after_drop() {
        let mut state = FmMessageState::new();
        state.on_replica_up();
        state.on_dropped();
        state.on_replica_up_acknowledged();
        assert_eq!(state.message_stage(), FmMessageStage::ReplicaDropped);
    }
}
