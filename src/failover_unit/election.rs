use super::FailoverUnit;
use crate::actions::{FmMessage, PeerMessage, StateMachineAction};
use crate::config::ReconfigurationConfig;
use crate::context::ExecutionContext;
use crate::epoch::{Epoch, ReplicaDeactivationInfo, INVALID_LSN};
use crate::failover_unit::ReplicaCloseMode;
use crate::messages::{ConfigurationMessageBody, ReplicaDescription, ReplicaMessageBody};
use crate::reconfig_state::ReconfigurationType;
use crate::replica::{Replica, ReplicaMessageStage, ReplicaRole, ReplicaState};
use crate::retryable_error::RetryableErrorStateName;
use tracing::info;

impl FailoverUnit {
    // ----- phase start -----

    /// Marks every answerable configuration replica pending and polls its
    /// progress (remote replicas via the peer agent, the local one via the
    /// replicator proxy).
    pub(crate) fn start_phase1_get_lsn(&mut self, context: &mut ExecutionContext<'_>) {
        let local_id = self.replica_store.local_replica_id();

        for replica in self.replica_store.configuration_remote_replicas_mut() {
            if replica.is_dropped() {
                continue;
            }
            replica.message_stage = ReplicaMessageStage::RaReplyPending;
        }
        self.local_replica_mut().message_stage = ReplicaMessageStage::RaProxyReplyPending;

        let remote_ids: Vec<i64> = self
            .replica_store
            .configuration_remote_replicas()
            .map(|r| r.replica_id)
            .collect();

        let mut sent = false;
        for replica_id in remote_ids {
            sent |= self.send_phase1_get_lsn_message(replica_id, context);
        }
        sent |= self.send_phase1_get_lsn_message(local_id, context);

        if sent {
            self.message_retry_active = true;
        }
    }

    /// Idempotent: keyed off the replica's message stage, so retries rebuild
    /// exactly the outstanding requests.
    pub(crate) fn send_phase1_get_lsn_message(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if replica.message_stage == ReplicaMessageStage::None {
            return false;
        }

        if self.replica_store.is_local(replica) {
            return self.send_replicator_get_status_message(context);
        }

        if !replica.is_up {
            return false;
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: replica.node,
            message: PeerMessage::GetLsn(ReplicaMessageBody {
                fu_desc: self.fu_desc,
                replica: ReplicaDescription::new(replica.node, replica.replica_id, replica.instance_id),
                service_desc: self.service_desc.clone(),
            }),
        });
        true
    }

    // ----- candidate selection -----

    fn replicas_for_get_lsn(&self, ignore_unknown_lsn: bool) -> Vec<&Replica> {
        self.replica_store
            .configuration_replicas()
            .filter(|r| {
                !r.is_dropped()
                    && r.is_lsn_set()
                    && !(ignore_unknown_lsn && r.is_lsn_unknown())
            })
            .collect()
    }

    /// Elects the next primary. `None` means no decision can be made yet
    /// (every best-progress candidate is down); the caller keeps waiting.
    pub(crate) fn try_find_primary(&self, config: &ReconfigurationConfig) -> Option<i64> {
        let mut eligible = self.replicas_for_get_lsn(true);

        if eligible.is_empty() {
            // Every configuration replica answered with unknown progress
            // (e.g. only never-finished builds remain). Data loss has been
            // declared by now; elect on raw progress.
            debug_assert!(
                !config.is_data_loss_lsn_check_enabled || self.is_data_loss_between_pc_and_cc(),
                "no eligible replica without declared data loss {}",
                self
            );
            return Some(self.find_primary_during_data_loss());
        }

        if config.is_deactivation_info_enabled
            && eligible.iter().all(|r| r.deactivation_info.is_valid())
        {
            self.remove_replicas_with_old_deactivation_epoch(&mut eligible, config);
        }

        if eligible.is_empty() {
            // Only not-caught-up or never-built replicas were left.
            return Some(self.find_primary_during_data_loss());
        }

        let mut primary = Self::find_first_up_with_highest_last_lsn(&eligible)?;

        // A swap forwards to a designated replica that already holds a
        // caught-up quorum; the backlog heuristic applies to failovers only.
        if self.reconfig_state.reconfig_type() == ReconfigurationType::Failover
            && primary == self.local_replica_id
        {
            primary = self.find_primary_with_best_catchup_capability(&eligible);
        }

        Some(primary)
    }

    /// Once data loss is declared the highest raw LSN wins, unknown-LSN
    /// replicas included, to minimize how much is lost.
    fn find_primary_during_data_loss(&self) -> i64 {
        let eligible = self.replicas_for_get_lsn(false);
        if eligible.is_empty() {
            return self.local_replica_id;
        }
        Self::find_replica_with_highest_last_lsn(&eligible)
    }

    /// Drops candidates whose certified deactivation epoch is strictly older
    /// than the newest one among candidates that completed their certified
    /// catchup: their acknowledged progress past that point may be false.
    fn remove_replicas_with_old_deactivation_epoch(
        &self,
        eligible: &mut Vec<&Replica>,
        config: &ReconfigurationConfig,
    ) {
        let max_epoch: Option<Epoch> = eligible
            .iter()
            .filter(|r| r.last_acknowledged_lsn >= r.deactivation_info.catchup_lsn)
            .map(|r| r.deactivation_info.deactivation_epoch)
            .max_by(|a, b| a.compare_primary(b));

        let Some(max_epoch) = max_epoch else {
            // Only replicas that never completed their certified catchup
            // are left; the data-loss fallback takes over.
            debug_assert!(
                !config.is_data_loss_lsn_check_enabled || self.is_data_loss_between_pc_and_cc(),
                "no caught-up candidate without declared data loss {}",
                self
            );
            return;
        };

        eligible.retain(|r| {
            r.deactivation_info
                .deactivation_epoch
                .compare_primary(&max_epoch)
                != std::cmp::Ordering::Less
        });
    }

    /// First max wins ties, matching the stability the election relies on.
    fn find_replica_with_highest_last_lsn(replicas: &[&Replica]) -> i64 {
        let mut best = replicas[0];
        for replica in &replicas[1..] {
            if replica.last_acknowledged_lsn > best.last_acknowledged_lsn {
                best = replica;
            }
        }
        best.replica_id
    }

    /// The first up replica carrying the highest last-acknowledged LSN;
    /// `None` when every replica at that LSN is down.
    fn find_first_up_with_highest_last_lsn(replicas: &[&Replica]) -> Option<i64> {
        let highest = replicas
            .iter()
            .map(|r| r.last_acknowledged_lsn)
            .max()
            .unwrap_or(INVALID_LSN);
        replicas
            .iter()
            .find(|r| r.last_acknowledged_lsn == highest && r.is_up)
            .map(|r| r.replica_id)
    }

    /// The local replica won on progress, but if its retained log cannot
    /// replay the furthest-behind replica, promote a same-progress remote
    /// with a wider retained window instead.
    fn find_primary_with_best_catchup_capability(&self, eligible: &[&Replica]) -> i64 {
        let local = self.local_replica();
        let local_first = local.first_acknowledged_lsn;
        let local_last = local.last_acknowledged_lsn;

        let mut candidate: &Replica = local;
        let mut lowest_last = local_last;

        for replica in eligible.iter().filter(|r| r.replica_id != local.replica_id) {
            if replica.last_acknowledged_lsn < 0 || !replica.is_in_configuration() {
                continue;
            }
            debug_assert!(
                replica.last_acknowledged_lsn <= local_last,
                "local replica won the election but is not at the highest LSN {}",
                self
            );

            if replica.last_acknowledged_lsn == local_last {
                if replica.first_acknowledged_lsn > 0
                    && (candidate.first_acknowledged_lsn == 0
                        || replica.first_acknowledged_lsn < candidate.first_acknowledged_lsn)
                {
                    candidate = replica;
                }
            } else if replica.last_acknowledged_lsn < lowest_last {
                lowest_last = replica.last_acknowledged_lsn;
            }
        }

        let redirect = candidate.replica_id != local.replica_id
            && lowest_last < local_last
            && (local_first > lowest_last + 1 || local_first == 0);

        if redirect {
            candidate.replica_id
        } else {
            self.local_replica_id
        }
    }

    // ----- phase finish -----

    pub(crate) fn finish_phase1_get_lsn(
        &mut self,
        primary_replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) {
        context.update.enable_update();

        if !self.local_replica().is_lsn_set() {
            // The election completed without the local replica's progress;
            // it is unlikely to ever report and cannot be promoted.
            let mode = if self.has_persisted_state() {
                ReplicaCloseMode::Restart
            } else {
                ReplicaCloseMode::Drop
            };
            self.start_close_local_replica(mode, None, context);
            return;
        }

        if primary_replica_id != self.local_replica_id {
            debug_assert!(
                self.reconfig_state.reconfig_type() != ReconfigurationType::SwapPrimary,
                "change configuration during swap {}",
                self
            );

            // Snapshot the request so resends carry the exact LSNs that
            // were compared at election time.
            self.change_config_fu_desc = Some(self.fu_desc);
            self.change_config_replicas =
                self.create_change_configuration_replica_list(primary_replica_id);

            self.send_change_configuration(context);

            let durations = self.reconfig_state.finish_with_change_configuration(context.now);
            self.enqueue_reconfiguration_complete_trace(durations, context);

            self.revert_configuration();
            info!(unit = %self.fu_desc, primary = primary_replica_id, "redirected primary election");
        } else {
            self.start_phase2_catchup_on_failover(context);
        }
    }

    /// LSNs go out only on the elected replica: the authority has no notion
    /// of epoch-certified progress, so handing it every LSN would let it
    /// re-derive a possibly-false-progress winner on its own.
    fn create_change_configuration_replica_list(
        &self,
        elected_replica_id: i64,
    ) -> Vec<ReplicaDescription> {
        let mut elected_found = false;
        let replicas: Vec<ReplicaDescription> = self
            .replica_store
            .configuration_replicas()
            .map(|replica| {
                let mut desc = ReplicaDescription::from(replica);
                if desc.replica_id == elected_replica_id {
                    elected_found = true;
                } else {
                    desc.invalidate_lsn();
                }
                desc
            })
            .collect();

        debug_assert!(
            elected_found,
            "change configuration without the elected replica {}",
            self
        );
        replicas
    }

    pub(crate) fn send_change_configuration(&self, context: &mut ExecutionContext<'_>) -> bool {
        let Some(fu_desc) = self.change_config_fu_desc else {
            return false;
        };
        debug_assert!(
            !self.change_config_replicas.is_empty(),
            "empty change configuration list {}",
            self
        );

        context
            .queue
            .enqueue(StateMachineAction::SendToFm(FmMessage::ChangeConfiguration(
                ConfigurationMessageBody {
                    fu_desc,
                    service_desc: self.service_desc.clone(),
                    replicas: self.change_config_replicas.clone(),
                },
            )));
        true
    }

    // ----- transition into catchup -----

    pub(crate) fn start_phase2_catchup_on_failover(&mut self, context: &mut ExecutionContext<'_>) {
        debug_assert!(
            self.local_replica().is_lsn_set(),
            "promoting a local replica that reported no progress {}",
            self
        );

        self.reconfig_state.start_phase2_catchup(context.now);
        self.update_local_state_on_phase2_catchup(context);

        // Restart decisions read pre-cleanup LSN state; compute first, then
        // apply.
        let decisions: Vec<(i64, bool)> = self
            .replica_store
            .configuration_remote_replicas()
            .map(|r| {
                (
                    r.replica_id,
                    self.is_remote_replica_restart_needed_after_get_lsn(r),
                )
            })
            .collect();

        for (replica_id, restart_needed) in decisions {
            if let Some(replica) = self.replica_store.get_mut(replica_id) {
                debug_assert!(
                    !replica.to_be_restarted,
                    "restart flag set before the election completed {}",
                    replica_id
                );
                replica.message_stage = ReplicaMessageStage::None;
                replica.try_clear_unknown_lsn();
                if restart_needed {
                    replica.to_be_restarted = true;
                }
            }
        }

        self.process_msg_resends(context);
    }

    pub(crate) fn update_local_state_on_phase2_catchup(
        &mut self,
        context: &mut ExecutionContext<'_>,
    ) {
        self.retryable_error_state
            .enter_state(RetryableErrorStateName::ReplicaChangeRoleAtCatchup);
        self.local_replica_mut().message_stage = ReplicaMessageStage::None;

        if self.is_primary_change_between_pc_and_cc() && self.local_replica().is_lsn_set() {
            // A brand-new primary (or one promoted past its certified
            // catchup point after data loss) re-seeds the deactivation info
            // from its own progress; builds propagate it from here.
            let is_new_replica = self.deactivation_info.is_dropped();
            let promoted_past_catchup =
                self.local_replica().last_acknowledged_lsn < self.deactivation_info.catchup_lsn;
            if is_new_replica || promoted_past_catchup {
                debug_assert!(
                    !context.config.is_data_loss_lsn_check_enabled
                        || self.is_data_loss_between_pc_and_cc(),
                    "deactivation info re-seeded without data loss {}",
                    self
                );
                self.deactivation_info = ReplicaDeactivationInfo::new(
                    self.fu_desc.current_configuration_epoch,
                    self.local_replica().last_acknowledged_lsn,
                );
            }
        }

        // The catchup update-configuration carries the replicator config.
        self.update_replicator_configuration = false;

        if self.local_replica().is_standby() {
            // Equivalent to receiving a create for the standby: build it.
            self.local_replica_mut().state = ReplicaState::InBuild;
            self.fm_message_state.reset();
        }
    }

    pub(crate) fn is_primary_change_between_pc_and_cc(&self) -> bool {
        let pc_primary = self
            .replica_store
            .iter()
            .find(|r| r.previous_configuration_role == ReplicaRole::Primary)
            .map(|r| r.replica_id);
        let cc_primary = self
            .replica_store
            .iter()
            .find(|r| r.current_configuration_role == ReplicaRole::Primary)
            .map(|r| r.replica_id);
        pc_primary != cc_primary
    }

    /// Up+Ready CC replicas must be restarted before deactivation when their
    /// reported progress cannot be served from the new primary's retained
    /// log, or when they never reported usable progress.
    pub(crate) fn is_remote_replica_restart_needed_after_get_lsn(&self, remote: &Replica) -> bool {
        let local = self.local_replica();

        if !remote.is_up || !remote.is_in_current_configuration() {
            return false;
        }
        if !remote.is_ready() {
            // InBuild and StandBy replicas get rebuilt anyway.
            return false;
        }
        if !remote.is_lsn_set() {
            return true;
        }
        if remote.is_lsn_unknown() {
            return true;
        }

        local.last_acknowledged_lsn > remote.last_acknowledged_lsn
            && (local.first_acknowledged_lsn == 0
                || remote.last_acknowledged_lsn < local.first_acknowledged_lsn - 1)
    }
}
