use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Current phase of a reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReconfigurationStage {
    #[default]
    None,
    Phase0Demote,
    Phase1GetLsn,
    Phase2Catchup,
    Phase3Deactivate,
    Phase4Activate,
    AbortPhase0Demote,
}

impl fmt::Display for ReconfigurationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconfigurationStage::None => "None",
            ReconfigurationStage::Phase0Demote => "Phase0_Demote",
            ReconfigurationStage::Phase1GetLsn => "Phase1_GetLSN",
            ReconfigurationStage::Phase2Catchup => "Phase2_Catchup",
            ReconfigurationStage::Phase3Deactivate => "Phase3_Deactivate",
            ReconfigurationStage::Phase4Activate => "Phase4_Activate",
            ReconfigurationStage::AbortPhase0Demote => "Abort_Phase0_Demote",
        };
        write!(f, "{}", s)
    }
}

/// Why a reconfiguration is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReconfigurationType {
    /// Primary change due to failure; requires GetLSN election.
    #[default]
    Failover,
    /// Membership change without a primary change.
    Other,
    /// Planned primary handoff with an explicit demote phase.
    SwapPrimary,
}

/// Outcome of the most recently finished reconfiguration. Kept across
/// `finish_*` so that a retried request for the same epoch can be answered
/// idempotently; cleared only by a full reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReconfigurationResult {
    #[default]
    Invalid,
    Completed,
    ChangeConfiguration,
    DemoteCompleted,
    AbortSwapPrimary,
}

/// Accumulated wall-clock time per phase, reported when a reconfiguration
/// finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseDurations {
    pub phase0: Duration,
    pub phase1: Duration,
    pub phase2: Duration,
    pub phase3: Duration,
    pub phase4: Duration,
}

impl PhaseDurations {
    pub fn total(&self) -> Duration {
        self.phase0 + self.phase1 + self.phase2 + self.phase3 + self.phase4
    }
}

/// The phase/type/result sub-state-machine of one reconfiguration, with
/// per-phase elapsed-time accounting.
///
/// Transitions follow a fixed edge list; calling a `start_*`/`finish_*`
/// method from the wrong predecessor stage is a coding error and panics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconfigurationState {
    stage: ReconfigurationStage,
    reconfig_type: ReconfigurationType,
    result: ReconfigurationResult,

    start_time: Option<DateTime<Utc>>,
    phase_start_time: Option<DateTime<Utc>>,
    durations: PhaseDurations,

    /// Demote time reported by the old primary on a continued swap.
    phase0_duration: Option<Duration>,
}

impl ReconfigurationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> ReconfigurationStage {
        self.stage
    }

    pub fn reconfig_type(&self) -> ReconfigurationType {
        self.reconfig_type
    }

    pub fn result(&self) -> ReconfigurationResult {
        self.result
    }

    pub fn is_reconfiguring(&self) -> bool {
        self.stage != ReconfigurationStage::None
    }

    pub fn is_swap_primary(&self) -> bool {
        self.reconfig_type == ReconfigurationType::SwapPrimary
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn phase_start_time(&self) -> Option<DateTime<Utc>> {
        self.phase_start_time
    }

    /// Demote time to forward with a continue-swap message. Available while
    /// a continued swap runs and after a demote has completed.
    pub fn phase0_duration(&self) -> Option<Duration> {
        self.phase0_duration
    }

    pub fn phase_elapsed(&self, now: DateTime<Utc>) -> Duration {
        match self.phase_start_time {
            Some(start) => (now - start).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    pub fn total_elapsed(&self, now: DateTime<Utc>) -> Duration {
        match self.start_time {
            Some(start) => (now - start).to_std().unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    /// Begin a reconfiguration. `continued_swap_phase0_duration` carries the
    /// demote time measured by the old primary when this node continues a
    /// swap; its presence forces the Phase1 entry point even for
    /// SwapPrimary.
    pub fn start(
        &mut self,
        reconfig_type: ReconfigurationType,
        continued_swap_phase0_duration: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        if self.stage != ReconfigurationStage::None {
            panic!(
                "reconfiguration start while already in {}: only None may start",
                self.stage
            );
        }

        self.reconfig_type = reconfig_type;
        self.result = ReconfigurationResult::Invalid;
        self.start_time = Some(now);
        self.phase_start_time = Some(now);
        self.durations = PhaseDurations::default();
        self.phase0_duration = continued_swap_phase0_duration;

        if let Some(d) = continued_swap_phase0_duration {
            self.durations.phase0 = d;
        }

        self.stage = match reconfig_type {
            ReconfigurationType::Failover => ReconfigurationStage::Phase1GetLsn,
            ReconfigurationType::Other => ReconfigurationStage::Phase2Catchup,
            ReconfigurationType::SwapPrimary => {
                if continued_swap_phase0_duration.is_some() {
                    ReconfigurationStage::Phase1GetLsn
                } else {
                    ReconfigurationStage::Phase0Demote
                }
            }
        };

        info!(
            stage = %self.stage,
            reconfig_type = ?reconfig_type,
            "reconfiguration started"
        );
    }

    pub fn start_phase2_catchup(&mut self, now: DateTime<Utc>) {
        self.transition(ReconfigurationStage::Phase1GetLsn, ReconfigurationStage::Phase2Catchup, now);
    }

    pub fn start_phase3_deactivate(&mut self, now: DateTime<Utc>) {
        self.transition(
            ReconfigurationStage::Phase2Catchup,
            ReconfigurationStage::Phase3Deactivate,
            now,
        );
    }

    pub fn start_phase4_activate(&mut self, now: DateTime<Utc>) {
        match self.stage {
            ReconfigurationStage::Phase2Catchup | ReconfigurationStage::Phase3Deactivate => {
                let from = self.stage;
                self.transition(from, ReconfigurationStage::Phase4Activate, now);
            }
            other => panic!(
                "invalid reconfiguration transition: {} -> Phase4_Activate",
                other
            ),
        }
    }

    pub fn start_abort_phase0_demote(&mut self, now: DateTime<Utc>) {
        self.transition(
            ReconfigurationStage::Phase0Demote,
            ReconfigurationStage::AbortPhase0Demote,
            now,
        );
    }

    /// Phase4 complete: the reconfiguration succeeded.
    pub fn finish(&mut self, now: DateTime<Utc>) -> PhaseDurations {
        self.finish_from(ReconfigurationStage::Phase4Activate, ReconfigurationResult::Completed, now)
    }

    /// Phase1 elected a remote replica; the request was redirected to the
    /// placement authority.
    pub fn finish_with_change_configuration(&mut self, now: DateTime<Utc>) -> PhaseDurations {
        self.finish_from(
            ReconfigurationStage::Phase1GetLsn,
            ReconfigurationResult::ChangeConfiguration,
            now,
        )
    }

    /// Demote complete on the outgoing primary. Reachable from Phase0, or
    /// from the abort stage when a demote-completed reply races the cancel.
    pub fn finish_demote(&mut self, now: DateTime<Utc>) -> PhaseDurations {
        match self.stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::AbortPhase0Demote => {
                let from = self.stage;
                self.finish_from(from, ReconfigurationResult::DemoteCompleted, now)
            }
            other => panic!("invalid reconfiguration transition: {} -> FinishDemote", other),
        }
    }

    pub fn finish_abort_swap_primary(&mut self, now: DateTime<Utc>) -> PhaseDurations {
        self.finish_from(
            ReconfigurationStage::AbortPhase0Demote,
            ReconfigurationResult::AbortSwapPrimary,
            now,
        )
    }

    /// Full reset (local replica down/dropped): clears the retained result
    /// as well.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn transition(
        &mut self,
        expected: ReconfigurationStage,
        next: ReconfigurationStage,
        now: DateTime<Utc>,
    ) {
        if self.stage != expected {
            panic!(
                "invalid reconfiguration transition: {} -> {} (expected to be in {})",
                self.stage, next, expected
            );
        }

        self.close_out_phase(now);
        self.stage = next;
        self.phase_start_time = Some(now);

        info!(stage = %next, "reconfiguration phase entered");
    }

    fn finish_from(
        &mut self,
        expected: ReconfigurationStage,
        result: ReconfigurationResult,
        now: DateTime<Utc>,
    ) -> PhaseDurations {
        if self.stage != expected {
            panic!(
                "invalid reconfiguration finish: {} with result {:?} (expected to be in {})",
                self.stage, result, expected
            );
        }

        self.close_out_phase(now);
        let durations = self.durations;

        info!(
            result = ?result,
            total_ms = durations.total().as_millis() as u64,
            "reconfiguration finished"
        );

        self.stage = ReconfigurationStage::None;
        self.result = result;
        self.start_time = None;
        self.phase_start_time = None;
        self.durations = PhaseDurations::default();
        // A completed demote keeps its measured duration so a retried
        // continue-swap message can carry it again.
        self.phase0_duration = if result == ReconfigurationResult::DemoteCompleted {
            Some(durations.phase0)
        } else {
            None
        };

        durations
    }

    fn close_out_phase(&mut self, now: DateTime<Utc>) {
        let elapsed = self.phase_elapsed(now);
        match self.stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::AbortPhase0Demote => {
                self.durations.phase0 += elapsed
            }
            ReconfigurationStage::Phase1GetLsn => self.durations.phase1 += elapsed,
            ReconfigurationStage::Phase2Catchup => self.durations.phase2 += elapsed,
            ReconfigurationStage::Phase3Deactivate => self.durations.phase3 += elapsed,
            ReconfigurationStage::Phase4Activate => self.durations.phase4 += elapsed,
            ReconfigurationStage::None => {}
        }
    }
}

impl fmt::Display for ReconfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {:?}", self.stage, self.reconfig_type, self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_failover_starts_at_phase1() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Failover, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase1GetLsn);
        assert!(state.is_reconfiguring());
    }

    #[test]
    fn test_other_skips_phase1() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Other, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase2Catchup);
    }

    #[test]
    fn test_swap_primary_entry_points() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::SwapPrimary, None, now());
        assert_eq!(state.stage(), ReconfigurationStage::Phase0Demote);

        let mut continued = ReconfigurationState::new();
        continued.start(
            ReconfigurationType::SwapPrimary,
            Some(Duration::from_secs(1)),
            now(),
        );
        assert_eq!(continued.stage(), ReconfigurationStage::Phase1GetLsn);
    }

    #[test]
    fn test_full_phase_progression() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::Failover, None, t);
        state.start_phase2_catchup(t);
        state.start_phase3_deactivate(t);
        state.start_phase4_activate(t);
        state.finish(t);

        assert_eq!(state.stage(), ReconfigurationStage::None);
        assert_eq!(state.result(), ReconfigurationResult::Completed);
        assert!(!state.is_reconfiguring());
    }

    #[test]
    fn test_phase3_can_be_skipped() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::Other, None, t);
        state.start_phase4_activate(t);
        assert_eq!(state.stage(), ReconfigurationStage::Phase4Activate);
    }

    #[test]
    fn test_change_configuration_keeps_result_after_finish() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::Failover, None, t);
        state.finish_with_change_configuration(t);
        assert_eq!(state.stage(), ReconfigurationStage::None);
        assert_eq!(state.result(), ReconfigurationResult::ChangeConfiguration);
    }

    #[test]
    fn test_abort_swap() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::SwapPrimary, None, t);
        state.start_abort_phase0_demote(t);
        assert_eq!(state.stage(), ReconfigurationStage::AbortPhase0Demote);
        state.finish_abort_swap_primary(t);
        assert_eq!(state.result(), ReconfigurationResult::AbortSwapPrimary);
    }

    #[test]
    fn test_demote_completed_races_abort() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::SwapPrimary, None, t);
        state.start_abort_phase0_demote(t);
        state.finish_demote(t);
        assert_eq!(state.result(), ReconfigurationResult::DemoteCompleted);
    }

    #[test]
    #[should_panic(expected = "invalid reconfiguration transition")]
    fn test_out_of_order_transition_panics() {
        let mut state = ReconfigurationState::new();
        state.start(ReconfigurationType::Failover, None, now());
        // Phase1 -> Phase3 is not an edge.
        state.start_phase3_deactivate(now());
    }

    #[test]
    fn test_demote_duration_survives_finish() {
        let mut state = ReconfigurationState::new();
        let t0 = now();
        let t1 = t0 + chrono::Duration::seconds(4);
        state.start(ReconfigurationType::SwapPrimary, None, t0);
        state.finish_demote(t1);
        assert_eq!(state.phase0_duration(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_reset_clears_result() {
        let mut state = ReconfigurationState::new();
        let t = now();
        state.start(ReconfigurationType::Failover, None, t);
        state.finish_with_change_configuration(t);
        state.reset();
        assert_eq!(state.result(), ReconfigurationResult::Invalid);
    }

    #[test]
    fn test_phase_durations_accumulate() {
        let mut state = ReconfigurationState::new();
        let t0 = now();
        let t1 = t0 + chrono::Duration::seconds(2);
        let t2 = t1 + chrono::Duration::seconds(3);
        state.start(ReconfigurationType::Other, None, t0);
        state.start_phase4_activate(t1);
        let durations = state.finish(t2);
        assert_eq!(durations.phase2, Duration::from_secs(2));
        assert_eq!(durations.phase4, Duration::from_secs(3));
        assert_eq!(durations.total(), Duration::from_secs(5));
    }
}
