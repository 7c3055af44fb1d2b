use super::FailoverUnit;
use crate::actions::{FmMessage, StateMachineAction};
use crate::context::ExecutionContext;
use crate::messages::ConfigurationMessageBody;
use crate::replica::{Replica, ReplicaMessageStage};

/// Progress counters over one configuration membership (PC or CC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaSetCounts {
    pub replica_count: usize,
    pub completed_count: usize,
    pub up_waiting_count: usize,
    pub down_waiting_count: usize,
}

impl ReplicaSetCounts {
    pub fn read_quorum_size(&self) -> usize {
        self.replica_count / 2 + 1
    }

    pub fn is_below_read_quorum(&self) -> bool {
        self.completed_count < self.read_quorum_size()
    }

    pub fn has_waiting_replicas(&self) -> bool {
        self.up_waiting_count + self.down_waiting_count > 0
    }
}

/// What Phase4 is still waiting on, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivateProgress {
    PendingActivateReplies,
    StuckInBuild,
    PendingRestarts,
    LocalReplyPending,
    ReplicatorUpdatePending,
    Done,
}

impl FailoverUnit {
    /// Counts replicas of one membership view. Dropped replicas count
    /// toward the total but can neither complete nor wait; `is_completed`
    /// decides the rest; waiting replicas split by up/down.
    pub(crate) fn count_progress<M, C>(&self, is_member: M, is_completed: C) -> ReplicaSetCounts
    where
        M: Fn(&Replica) -> bool,
        C: Fn(&Replica) -> bool,
    {
        let mut counts = ReplicaSetCounts::default();
        for replica in self.replica_store.iter().filter(|r| is_member(r)) {
            counts.replica_count += 1;
            if is_completed(replica) {
                counts.completed_count += 1;
            } else if replica.is_dropped() {
                // Can never answer; not waited on.
            } else if replica.is_up {
                counts.up_waiting_count += 1;
            } else {
                counts.down_waiting_count += 1;
            }
        }
        counts
    }

    /// Counts one membership view for the progress-poll phase. A replica
    /// that answered with the unknown sentinel can never complete and is
    /// not waited on either (it behaves like a dropped replica here).
    pub(crate) fn count_get_lsn_progress<M>(&self, is_member: M) -> ReplicaSetCounts
    where
        M: Fn(&Replica) -> bool,
    {
        let mut counts = ReplicaSetCounts::default();
        for replica in self.replica_store.iter().filter(|r| is_member(r)) {
            counts.replica_count += 1;
            if replica.is_dropped() || replica.is_lsn_unknown() {
                continue;
            }
            if replica.is_lsn_set() {
                counts.completed_count += 1;
            } else if replica.is_up {
                counts.up_waiting_count += 1;
            } else {
                counts.down_waiting_count += 1;
            }
        }
        counts
    }

    /// Whether enough progress responses arrived to run the election.
    /// Reports data loss (gated per data-loss version) while a
    /// configuration is stuck below read quorum.
    pub(crate) fn check_phase1_get_lsn_progress(
        &mut self,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let pc = self.count_get_lsn_progress(Replica::is_in_previous_configuration);
        let cc = self.count_get_lsn_progress(Replica::is_in_current_configuration);

        // Up replicas get the configured grace period to answer before the
        // election proceeds without them.
        let wait_elapsed = self.reconfig_state.phase_elapsed(context.now)
            >= context.config.remote_replica_progress_query_wait_duration;
        if !wait_elapsed && (pc.up_waiting_count > 0 || cc.up_waiting_count > 0) {
            return false;
        }

        // Below quorum with replicas still able to answer: keep waiting.
        if (pc.is_below_read_quorum() && pc.has_waiting_replicas())
            || (cc.is_below_read_quorum() && cc.has_waiting_replicas())
        {
            return false;
        }

        if self.check_data_loss_at_get_lsn(pc, cc, context) {
            // Wait for the data-loss report exchange to complete.
            return false;
        }

        true
    }

    /// Quorum loss at election time means acknowledged writes may be gone.
    /// The report makes the failover manager declare data loss by bumping
    /// the data-loss version; until that bump arrives, repeated checks
    /// resend the same report.
    fn check_data_loss_at_get_lsn(
        &mut self,
        pc: ReplicaSetCounts,
        cc: ReplicaSetCounts,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if self.is_swap_primary() {
            // The old primary completed quorum catchup before forwarding the
            // swap, so this replica already holds all the data.
            return false;
        }

        let cc_data_loss_version = self.fu_desc.current_configuration_epoch.data_loss_version;
        let pc_data_loss_version = self.fu_desc.previous_configuration_epoch.data_loss_version;

        let pc_triggers = pc.is_below_read_quorum() && cc_data_loss_version == pc_data_loss_version;
        let cc_triggers = cc.is_below_read_quorum()
            && (self.data_loss_version_to_report == 0
                || cc_data_loss_version <= self.data_loss_version_to_report);

        if pc_triggers || cc_triggers {
            if self.data_loss_version_to_report != cc_data_loss_version {
                context.update.enable_update();
                self.data_loss_version_to_report = cc_data_loss_version;
            }
            self.enqueue_data_loss_report(context);
            return true;
        }

        false
    }

    pub(crate) fn enqueue_data_loss_report(&self, context: &mut ExecutionContext<'_>) {
        context
            .queue
            .enqueue(StateMachineAction::SendToFm(FmMessage::DataLossReport(
                self.configuration_message_body(),
            )));
    }

    /// Phase3 completes once a read quorum of PC members confirmed (or can
    /// never confirm) deactivation and no answerable up PC member is still
    /// pending. Replicas mid-build or awaiting restart cannot reply and are
    /// not waited on.
    pub(crate) fn check_phase3_deactivate_progress(&self) -> bool {
        let mut counts = ReplicaSetCounts::default();
        for replica in self
            .replica_store
            .iter()
            .filter(|r| r.is_in_previous_configuration())
        {
            counts.replica_count += 1;
            if replica.is_dropped() || replica.message_stage == ReplicaMessageStage::None {
                counts.completed_count += 1;
            } else if replica.is_build_in_progress() || replica.to_be_restarted {
                // Cannot answer a deactivate yet.
            } else if replica.is_up {
                counts.up_waiting_count += 1;
            } else {
                counts.down_waiting_count += 1;
            }
        }

        !counts.is_below_read_quorum() && counts.up_waiting_count == 0
    }

    /// What Phase4 is still blocked on, checked in strict priority order.
    pub(crate) fn check_phase4_activate_progress(&self) -> ActivateProgress {
        let local_id = self.replica_store.local_replica_id();

        let pending_activate = self.replica_store.iter().any(|r| {
            r.replica_id != local_id
                && r.is_in_current_configuration()
                && r.is_up
                && r.is_ready()
                && r.message_stage != ReplicaMessageStage::None
        });
        if pending_activate {
            return ActivateProgress::PendingActivateReplies;
        }

        let stuck_in_build = self.replica_store.iter().any(|r| {
            r.replica_id != local_id && r.is_in_current_configuration() && r.is_up && r.is_in_build()
        });
        if stuck_in_build {
            return ActivateProgress::StuckInBuild;
        }

        if self.replica_store.iter().any(|r| r.to_be_restarted) {
            return ActivateProgress::PendingRestarts;
        }

        if self.local_replica().message_stage != ReplicaMessageStage::None {
            return ActivateProgress::LocalReplyPending;
        }

        if self.update_replicator_configuration {
            return ActivateProgress::ReplicatorUpdatePending;
        }

        ActivateProgress::Done
    }

    /// The end-reconfiguration update to the replicator is owed only by a
    /// primary, once every answerable remote has activated or the update
    /// was explicitly requested.
    pub(crate) fn is_end_reconfiguration_message_pending(&self) -> bool {
        if self.is_closed() || !self.local_replica().is_up {
            return false;
        }
        if self.local_replica().current_configuration_role
            != crate::replica::ReplicaRole::Primary
        {
            return false;
        }
        self.update_replicator_configuration
            || self.local_replica().message_stage != ReplicaMessageStage::None
    }

    pub(crate) fn configuration_message_body(&self) -> ConfigurationMessageBody {
        ConfigurationMessageBody {
            fu_desc: self.fu_desc,
            service_desc: self.service_desc.clone(),
            replicas: self
                .replica_store
                .iter()
                .map(crate::messages::ReplicaDescription::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_quorum_arithmetic() {
        let counts = ReplicaSetCounts {
            replica_count: 3,
            completed_count: 1,
            up_waiting_count: 2,
            down_waiting_count: 0,
        };
        assert_eq!(counts.read_quorum_size(), 2);
        assert!(counts.is_below_read_quorum());

        let counts = ReplicaSetCounts {
            completed_count: 2,
            ..counts
        };
        assert!(!counts.is_below_read_quorum());
    }

    #[test]
    fn test_quorum_of_one() {
        let counts = ReplicaSetCounts {
            replica_count: 1,
            completed_count: 1,
            up_waiting_count: 0,
            down_waiting_count: 0,
        };
        assert_eq!(counts.read_quorum_size(), 1);
        assert!(!counts.is_below_read_quorum());
    }

    #[test]
    fn test_even_replica_count_quorum() {
        let counts = ReplicaSetCounts {
            replica_count: 4,
            completed_count: 2,
            up_waiting_count: 2,
            down_waiting_count: 0,
        };
        // floor(4/2)+1 = 3.
        assert_eq!(counts.read_quorum_size(), 3);
        assert!(counts.is_below_read_quorum());
    }
}
