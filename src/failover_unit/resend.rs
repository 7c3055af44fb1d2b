use super::FailoverUnit;
use crate::actions::{PeerMessage, ProxyMessage, StateMachineAction, UpdateConfigurationReason};
use crate::context::ExecutionContext;
use crate::epoch::ReplicaDeactivationInfo;
use crate::failover_unit::progress::ActivateProgress;
use crate::messages::{ConfigurationMessageBody, ReplicaDescription, ReplicaMessageBody};
use crate::reconfig_state::ReconfigurationStage;
use crate::replica::{ReplicaMessageStage, ReplicaRole, ReplicaState};

/// Message retry. Nothing here changes protocol state: every send is
/// re-derived from the unit's current state, so a retry is exactly the
/// message the original attempt would produce now. The retry timer keeps
/// firing while anything reports pending.
impl FailoverUnit {
    /// Re-derives and resends every outstanding message of the unit.
    /// Returns whether anything is still pending.
    pub fn process_msg_resends(&mut self, context: &mut ExecutionContext<'_>) -> bool {
        if self.is_closed() || !self.local_replica_open {
            self.message_retry_active = false;
            return false;
        }

        let replica_ids: Vec<i64> = self.replica_store.iter().map(|r| r.replica_id).collect();
        let mut pending = false;
        for replica_id in replica_ids {
            pending |= self.process_replica_message_resend_by_id(replica_id, context);
        }
        pending |= self.process_phase_message_resends(context);
        pending |= self.send_data_loss_report_message(context);
        pending |= self.process_endpoint_publish_resend(context);

        self.message_retry_active = pending;
        pending
    }

    /// The per-replica message owed in the current stage, if any.
    pub(crate) fn process_replica_message_resend_by_id(
        &mut self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        match self.reconfig_state.stage() {
            ReconfigurationStage::Phase1GetLsn => {
                self.send_phase1_get_lsn_message(replica_id, context)
            }
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                self.send_replica_lifecycle_messages(replica_id, context)
                    || self.send_deactivation_info_update_message(replica_id, context)
                    || self.send_restart_remote_replica_message(replica_id, context)
            }
            ReconfigurationStage::Phase3Deactivate => {
                self.send_replica_lifecycle_messages(replica_id, context)
                    || self.send_phase3_deactivate_message(replica_id, context)
                    || self.send_restart_remote_replica_message(replica_id, context)
            }
            ReconfigurationStage::Phase4Activate => {
                self.send_replica_lifecycle_messages(replica_id, context)
                    || self.send_activate_message_to(replica_id, context)
                    || self.send_restart_remote_replica_message(replica_id, context)
            }
            ReconfigurationStage::None => {
                self.send_replica_lifecycle_messages(replica_id, context)
                    || self.send_activate_message_to(replica_id, context)
            }
            // Everything waits for the cancel to resolve.
            ReconfigurationStage::AbortPhase0Demote => false,
        }
    }

    /// The phase-level message owed to the replicator proxy, if any.
    fn process_phase_message_resends(&mut self, context: &mut ExecutionContext<'_>) -> bool {
        match self.reconfig_state.stage() {
            ReconfigurationStage::None | ReconfigurationStage::Phase3Deactivate => {
                self.send_update_replicator_configuration_message(context)
            }
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                self.send_update_configuration_message(UpdateConfigurationReason::Catchup, context)
            }
            ReconfigurationStage::Phase4Activate => {
                self.send_end_reconfiguration_message(context)
            }
            ReconfigurationStage::AbortPhase0Demote => self.send_cancel_catchup_message(context),
            ReconfigurationStage::Phase1GetLsn => false,
        }
    }

    // ----- per-replica senders -----

    /// Create/build/remove for a replica this node is (re)building. Only a
    /// replica-set authority sends these: the current primary, or the
    /// demoting primary while the swap is still on this node.
    fn send_replica_lifecycle_messages(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let local = self.local_replica();
        let is_authority = local.current_configuration_role == ReplicaRole::Primary
            || (local.previous_configuration_role == ReplicaRole::Primary
                && local.current_configuration_role == ReplicaRole::Secondary);
        if !is_authority || replica_id == self.local_replica_id {
            return false;
        }
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if replica.current_configuration_role == ReplicaRole::Primary {
            return false;
        }

        if replica.is_up && replica.is_in_create() {
            let mut desc = ReplicaDescription::from(replica);
            desc.current_configuration_role = ReplicaRole::Idle;
            desc.deactivation_info = Some(self.deactivation_info);
            context.queue.enqueue(StateMachineAction::SendToPeer {
                target: replica.node,
                message: PeerMessage::CreateReplica(ReplicaMessageBody {
                    fu_desc: self.fu_desc,
                    replica: desc,
                    service_desc: self.service_desc.clone(),
                }),
            });
            return true;
        }

        if replica.is_up && replica.is_build_in_progress() {
            context.queue.enqueue(StateMachineAction::SendToProxy(
                ProxyMessage::BuildIdleReplica(ReplicaMessageBody {
                    fu_desc: self.fu_desc,
                    replica: ReplicaDescription::from(replica),
                    service_desc: self.service_desc.clone(),
                }),
            ));
            return true;
        }

        if !replica.is_up && replica.replicator_remove_pending {
            context.queue.enqueue(StateMachineAction::SendToProxy(
                ProxyMessage::RemoveIdleReplica(ReplicaMessageBody {
                    fu_desc: self.fu_desc,
                    replica: ReplicaDescription::from(replica),
                    service_desc: self.service_desc.clone(),
                }),
            ));
            return true;
        }

        false
    }

    /// A freshly built replica learns its certified deactivation point
    /// through a (non-forced) deactivate during catchup.
    fn send_deactivation_info_update_message(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if !replica.is_in_build() || !replica.to_be_deactivated || !replica.is_up {
            return false;
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: replica.node,
            message: PeerMessage::Deactivate {
                body: self.deactivate_or_activate_body(replica_id),
                deactivation_info: self.deactivation_info,
                is_force: false,
            },
        });
        true
    }

    /// A forced deactivate restarting a replica whose acknowledged progress
    /// cannot be trusted.
    fn send_restart_remote_replica_message(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if !replica.to_be_restarted || !replica.is_up {
            return false;
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: replica.node,
            message: PeerMessage::Deactivate {
                body: self.deactivate_or_activate_body(replica_id),
                deactivation_info: ReplicaDeactivationInfo::empty(),
                is_force: true,
            },
        });
        true
    }

    fn send_phase3_deactivate_message(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if replica.message_stage != ReplicaMessageStage::RaReplyPending
            || !replica.is_up
            || replica.is_in_create()
            || (replica.is_in_build() && !replica.to_be_deactivated)
            || replica.to_be_restarted
        {
            return false;
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: replica.node,
            message: PeerMessage::Deactivate {
                body: self.deactivate_or_activate_body(replica_id),
                deactivation_info: self.deactivation_info,
                is_force: false,
            },
        });
        true
    }

    /// Activate owed to a configuration member in Phase4, or to a finished
    /// idle build outside any reconfiguration.
    pub(crate) fn send_activate_message_to(
        &self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if replica_id == self.local_replica_id {
            return false;
        }
        let Some(replica) = self.replica_store.get(replica_id) else {
            return false;
        };
        if !replica.is_in_current_configuration() && !replica.to_be_activated {
            return false;
        }
        if replica.message_stage != ReplicaMessageStage::RaReplyPending
            || !replica.is_up
            || replica.is_in_create()
            || (replica.is_in_build() && !replica.to_be_activated)
            || replica.to_be_restarted
        {
            return false;
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: replica.node,
            message: PeerMessage::Activate {
                body: self.deactivate_or_activate_body(replica_id),
                deactivation_info: self.deactivation_info,
            },
        });
        true
    }

    // ----- phase-level senders -----

    /// Always sendable: the body is re-derived, so the latest configuration
    /// wins regardless of how many retries raced.
    pub(crate) fn send_update_configuration_message(
        &self,
        reason: UpdateConfigurationReason,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::UpdateConfiguration {
                body: self.replication_configuration_body(),
                reason,
            },
        ));
        true
    }

    pub(crate) fn send_update_replicator_configuration_message(
        &self,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if !self.update_replicator_configuration
            || self.is_closed()
            || !self.local_replica().is_up
        {
            return false;
        }
        let reason = match self.reconfig_state.stage() {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                UpdateConfigurationReason::Catchup
            }
            _ => UpdateConfigurationReason::Default,
        };
        self.send_update_configuration_message(reason, context)
    }

    /// The closing update of Phase4. Sent as the end-reconfiguration command
    /// only once every answerable remote has activated; before that, a plain
    /// update carries any pending configuration change.
    pub(crate) fn send_end_reconfiguration_message(
        &self,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if !self.is_end_reconfiguration_message_pending() {
            return false;
        }
        let all_activated =
            self.check_phase4_activate_progress() != ActivateProgress::PendingActivateReplies;
        if !self.update_replicator_configuration && !all_activated {
            return false;
        }
        let reason = if all_activated {
            UpdateConfigurationReason::EndReconfiguration
        } else {
            UpdateConfigurationReason::Default
        };
        self.send_update_configuration_message(reason, context)
    }

    pub(crate) fn send_cancel_catchup_message(&self, context: &mut ExecutionContext<'_>) -> bool {
        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::CancelCatchupReplicaSet(self.replication_configuration_body()),
        ));
        true
    }

    /// Repeats the data-loss report until the manager's epoch bump proves it
    /// was acted on.
    fn send_data_loss_report_message(&self, context: &mut ExecutionContext<'_>) -> bool {
        if self.data_loss_version_to_report == 0 {
            return false;
        }
        if self.fu_desc.current_configuration_epoch.data_loss_version
            > self.data_loss_version_to_report
        {
            return false;
        }
        self.enqueue_data_loss_report(context);
        true
    }

    fn process_endpoint_publish_resend(&mut self, context: &mut ExecutionContext<'_>) -> bool {
        if self.endpoint_publish_state.should_publish_on_timer(context.now) {
            // Waited long enough for the reconfiguration to finish; publish
            // through the regular manager-message path.
            self.fm_message_state.on_endpoint_available();
            return true;
        }
        self.endpoint_publish_state.is_publish_pending()
    }

    // ----- message bodies -----

    /// Body for a deactivate/activate to `target_id`. The target's own
    /// record is reported Ready even mid-build: from the target's view the
    /// build completed, and its deactivation-info update depends on that.
    fn deactivate_or_activate_body(&self, target_id: i64) -> ConfigurationMessageBody {
        let mut replicas: Vec<ReplicaDescription> = self
            .replica_store
            .configuration_replicas()
            .map(ReplicaDescription::from)
            .collect();
        if !replicas.iter().any(|d| d.replica_id == target_id) {
            if let Some(replica) = self.replica_store.get(target_id) {
                replicas.push(ReplicaDescription::from(replica));
            }
        }
        for desc in &mut replicas {
            if desc.replica_id == target_id && desc.state == ReplicaState::InBuild {
                desc.state = ReplicaState::Ready;
            }
        }
        ConfigurationMessageBody {
            fu_desc: self.fu_desc,
            service_desc: self.service_desc.clone(),
            replicas,
        }
    }

    /// Configuration replicas only: idle replicas are not part of the
    /// replica set handed to the replicator.
    fn replication_configuration_body(&self) -> ConfigurationMessageBody {
        ConfigurationMessageBody {
            fu_desc: self.fu_desc,
            service_desc: self.service_desc.clone(),
            replicas: self
                .replica_store
                .configuration_replicas()
                .map(ReplicaDescription::from)
                .collect(),
        }
    }
}
