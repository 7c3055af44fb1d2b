use super::FailoverUnit;
use crate::actions::{
    FmMessage, PeerMessage, ProxyMessage, ReplicaHealthEvent, StateMachineAction, TraceRecord,
    UpdateConfigurationReason,
};
use crate::context::ExecutionContext;
use crate::epoch::{Epoch, ReplicaDeactivationInfo, INVALID_LSN};
use crate::error::ErrorCode;
use crate::failover_unit::ReplicaCloseMode;
use crate::messages::{
    ConfigurationMessageBody, ConfigurationReplyMessageBody, DoReconfigurationMessageBody,
    FailoverUnitDescription, ProxyReplyMessageBody, ReplicaDescription, ReplicaMessageBody,
    ReplicaReplyMessageBody,
};
use crate::node::NodeInstance;
use crate::reconfig_state::{ReconfigurationResult, ReconfigurationStage, ReconfigurationType};
use crate::replica::{Replica, ReplicaMessageStage, ReplicaRole, ReplicaState};
use crate::failover_unit::progress::ActivateProgress;
use std::cmp::Ordering;
use tracing::{debug, info};

impl FailoverUnit {
    // ----- reconfiguration request from the failover manager -----

    /// Entry point for a reconfiguration request. Idempotent: a retried
    /// request for an already-finished reconfiguration is answered from the
    /// retained result; a retry of the in-flight one refreshes remote
    /// replica state and pushes the protocol along.
    pub fn process_do_reconfiguration(
        &mut self,
        body: &DoReconfigurationMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !self.local_replica_open || self.local_replica_close_pending {
            debug!(unit = %self.fu_desc, "reconfiguration dropped: local replica not open");
            return;
        }
        if body.fu_desc.current_configuration_epoch < self.fu_desc.current_configuration_epoch {
            debug!(unit = %self.fu_desc, "stale reconfiguration request dropped");
            return;
        }
        if !self.can_process_do_reconfiguration(body, context) {
            return;
        }

        // The request proves the manager knows this replica is up.
        self.fm_message_state.on_replica_up_acknowledged();

        if self.try_abort_reconfiguration(&body.fu_desc, context) {
            self.touch(context.now);
            return;
        }

        let Some(local_desc) = body.replica(self.local_replica_id) else {
            debug_assert!(
                false,
                "reconfiguration request without the local replica {}",
                self
            );
            return;
        };

        let is_fresh = !self.reconfig_state.is_reconfiguring();
        if is_fresh {
            context.update.enable_update();
            self.update_reconfiguration_epochs_on_start(&body.fu_desc);

            let reconfig_type = self.identify_reconfiguration_type(body, local_desc);
            self.reconfig_state
                .start(reconfig_type, body.phase0_duration, context.now);

            self.update_local_replica_states_and_roles(local_desc);
            self.update_remote_replica_roles(body);
            self.update_remote_replica_states(body, true);

            self.sender_node = None;
            self.start_reconfiguration(context);
        } else {
            let changed = self.update_remote_replica_states(body, false);
            if changed {
                context.update.enable_update();
                self.mark_replication_configuration_update_pending();
            }
            self.check_reconfiguration_progress(context);
            if changed && !self.local_replica_close_pending {
                self.process_msg_resends(context);
            }
        }

        self.touch(context.now);
        self.assert_invariants();
    }

    /// Gate for a reconfiguration request. Returns false when the request
    /// is a retry of a finished reconfiguration; the retained result decides
    /// which reply is resent.
    fn can_process_do_reconfiguration(
        &self,
        body: &DoReconfigurationMessageBody,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if self.reconfig_state.is_reconfiguring() {
            return true;
        }
        if self.fu_desc.current_configuration_epoch != body.fu_desc.current_configuration_epoch {
            return true;
        }
        match self.reconfig_state.result() {
            ReconfigurationResult::DemoteCompleted => {
                self.send_continue_swap_primary_message(Some(body), context);
            }
            ReconfigurationResult::Completed => {
                self.send_do_reconfiguration_reply(context);
            }
            ReconfigurationResult::ChangeConfiguration => {
                self.send_change_configuration(context);
            }
            _ => return true,
        }
        false
    }

    /// A higher-epoch request aborts an in-flight demote; any other stage
    /// keeps running and the manager retries.
    fn try_abort_reconfiguration(
        &mut self,
        incoming: &FailoverUnitDescription,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        if !self.reconfig_state.is_reconfiguring() {
            return false;
        }
        if self.reconfig_state.stage() == ReconfigurationStage::AbortPhase0Demote {
            // Already aborting; the request is re-examined once the cancel
            // completes.
            return true;
        }
        if incoming
            .current_configuration_epoch
            .compare_primary(&self.fu_desc.current_configuration_epoch)
            != Ordering::Greater
        {
            return false;
        }
        if self.reconfig_state.stage() == ReconfigurationStage::Phase0Demote {
            context.update.enable_update();
            self.start_abort_phase0_demote(context);
            return true;
        }
        false
    }

    fn update_reconfiguration_epochs_on_start(&mut self, incoming: &FailoverUnitDescription) {
        self.update_reconfiguration_epochs(incoming);
        self.local_replica_mut().intermediate_configuration_role = ReplicaRole::None;

        let local = self.local_replica();
        let keep_remotes =
            local.current_configuration_role == ReplicaRole::Primary && local.is_ready();
        if !keep_remotes {
            // Anything this node believed about remote configuration
            // replicas predates its promotion; the request is authoritative.
            let local_id = self.local_replica_id;
            self.replica_store
                .retain(|r| r.replica_id == local_id || !r.is_in_configuration());
        }
    }

    /// Classifies the incoming request. The order of the checks matters: a
    /// continued swap is recognized by the forwarded demote duration before
    /// anything else, and an established primary always takes the catchup
    /// shortcut.
    fn identify_reconfiguration_type(
        &self,
        body: &DoReconfigurationMessageBody,
        local_desc: &ReplicaDescription,
    ) -> ReconfigurationType {
        if body.phase0_duration.is_some() {
            return ReconfigurationType::SwapPrimary;
        }

        if !Self::is_primary_change_in_request(&body.replicas) {
            return ReconfigurationType::Other;
        }

        if local_desc.current_configuration_role == ReplicaRole::Secondary {
            debug_assert!(
                self.local_replica().current_configuration_role == ReplicaRole::Primary
                    && self.local_replica().is_ready(),
                "demote requested on a replica that is not a ready primary {}",
                self
            );
            return ReconfigurationType::SwapPrimary;
        }

        if self.reconfig_state.result() == ReconfigurationResult::AbortSwapPrimary {
            // The aborted swap left this node primary; the retried request
            // re-establishes the configuration without an election.
            return ReconfigurationType::Other;
        }

        if self.reconfig_state.result() != ReconfigurationResult::ChangeConfiguration
            && self.local_replica().current_configuration_role == ReplicaRole::Primary
            && self.local_replica().is_ready()
            && local_desc.current_configuration_role == ReplicaRole::Primary
        {
            return ReconfigurationType::Other;
        }

        ReconfigurationType::Failover
    }

    fn is_primary_change_in_request(replicas: &[ReplicaDescription]) -> bool {
        let pc_primary = replicas
            .iter()
            .find(|r| r.previous_configuration_role == ReplicaRole::Primary)
            .map(|r| r.replica_id);
        let cc_primary = replicas
            .iter()
            .find(|r| r.current_configuration_role == ReplicaRole::Primary)
            .map(|r| r.replica_id);
        pc_primary != cc_primary
    }

    fn update_local_replica_states_and_roles(&mut self, desc: &ReplicaDescription) {
        let local = self.local_replica_mut();
        if desc.is_lsn_set() {
            // A continued swap forwards the progress the old primary read.
            local.first_acknowledged_lsn = desc.first_acknowledged_lsn;
            local.last_acknowledged_lsn = desc.last_acknowledged_lsn;
        }
        local.previous_configuration_role = desc.previous_configuration_role;
        local.current_configuration_role = desc.current_configuration_role;
    }

    fn update_remote_replica_roles(&mut self, body: &DoReconfigurationMessageBody) {
        for desc in &body.replicas {
            if desc.replica_id == self.local_replica_id {
                continue;
            }
            match self.replica_store.get_mut(desc.replica_id) {
                Some(replica) => {
                    replica.intermediate_configuration_role = ReplicaRole::None;
                    replica.previous_configuration_role = desc.previous_configuration_role;
                    replica.current_configuration_role = desc.current_configuration_role;
                    replica.service_location = desc.service_location.clone();
                    replica.replication_endpoint = desc.replication_endpoint.clone();
                }
                None => {
                    let mut replica =
                        Replica::new(desc.replica_id, desc.instance_id, desc.node);
                    replica.previous_configuration_role = desc.previous_configuration_role;
                    replica.current_configuration_role = desc.current_configuration_role;
                    // A configuration member the old primary was still
                    // building must be rebuilt from here; it enters as
                    // standby.
                    replica.state = if desc.current_configuration_role >= ReplicaRole::Secondary
                        && desc.state == ReplicaState::InBuild
                    {
                        ReplicaState::StandBy
                    } else {
                        desc.state
                    };
                    replica.is_up = desc.is_up;
                    replica.service_location = desc.service_location.clone();
                    replica.replication_endpoint = desc.replication_endpoint.clone();
                    self.replica_store.add(replica);
                }
            }
        }
    }

    /// Reconciles stored remote replicas with the up/down/instance facts the
    /// manager reports. Returns whether the replicator's view of the
    /// configuration changed.
    fn update_remote_replica_states(
        &mut self,
        body: &DoReconfigurationMessageBody,
        starting: bool,
    ) -> bool {
        let stage = self.reconfig_state.stage();
        let local_cc_primary =
            self.local_replica().current_configuration_role == ReplicaRole::Primary;
        let remove_possible = stage != ReconfigurationStage::Phase1GetLsn && local_cc_primary;
        let catchup_stage = matches!(
            stage,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup
        );
        let activate_stage = matches!(
            stage,
            ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate
        );
        let local_id = self.local_replica_id;

        let mut changed = false;
        for desc in &body.replicas {
            if desc.replica_id == local_id {
                continue;
            }
            let Some(replica) = self.replica_store.get_mut(desc.replica_id) else {
                continue;
            };
            if replica.replicator_remove_pending {
                continue;
            }

            if replica.to_be_restarted {
                let restarted =
                    desc.instance_id > replica.instance_id || (replica.is_up && !desc.is_up);
                if !restarted {
                    continue;
                }
                replica.to_be_restarted = false;
            }

            if desc.instance_id > replica.instance_id {
                if replica.is_up
                    && (replica.is_in_build() || !replica.is_in_current_configuration())
                {
                    // The old instance is still known to the replicator; it
                    // must come out before the new instance can be built.
                    replica.is_up = false;
                    if replica.is_in_build() && remove_possible {
                        replica.replicator_remove_pending = true;
                        replica.to_be_activated = false;
                        replica.to_be_deactivated = false;
                        if starting {
                            replica.message_stage = ReplicaMessageStage::None;
                        }
                    }
                } else {
                    replica.instance_id = desc.instance_id;
                    replica.node = desc.node;
                    replica.is_up = true;
                    replica.state = ReplicaState::StandBy;
                    changed = true;
                }
                continue;
            }

            if desc.is_up {
                if replica.is_up
                    && replica.is_standby()
                    && desc.state == ReplicaState::InBuild
                    && local_cc_primary
                {
                    // The old primary's unfinished build becomes ours.
                    replica.state = ReplicaState::InCreate;
                    if activate_stage && replica.message_stage == ReplicaMessageStage::None {
                        replica.message_stage = ReplicaMessageStage::RaReplyPending;
                    }
                } else if desc.state == ReplicaState::Ready
                    && replica.is_up
                    && !replica.is_ready()
                {
                    replica.state = ReplicaState::Ready;
                    replica.service_location = desc.service_location.clone();
                    replica.replication_endpoint = desc.replication_endpoint.clone();
                } else if replica.is_up
                    && replica.is_in_build()
                    && replica.to_be_activated
                    && desc.state == ReplicaState::InBuild
                    && starting
                {
                    // The activate never reached it; deactivate it in the
                    // new reconfiguration instead.
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = true;
                    replica.message_stage = ReplicaMessageStage::None;
                }
                continue;
            }

            // Same instance, reported down.
            if replica.is_up {
                replica.is_up = false;
                changed = true;
                let idle_promotion_in_catchup = replica.previous_configuration_role
                    == ReplicaRole::Idle
                    && replica.current_configuration_role == ReplicaRole::Secondary
                    && catchup_stage;
                if remove_possible && (replica.is_in_build() || idle_promotion_in_catchup) {
                    replica.replicator_remove_pending = true;
                    replica.to_be_activated = false;
                    replica.to_be_deactivated = false;
                    // The remove command carries the configuration change.
                    changed = false;
                    if starting {
                        replica.message_stage = ReplicaMessageStage::None;
                    }
                }
            }
            if desc.state == ReplicaState::Dropped && !replica.is_dropped() {
                replica.mark_as_dropped();
            }
        }
        changed
    }

    /// Remembers that the replicator must be told about a configuration
    /// change; which message carries it depends on the stage.
    pub(crate) fn mark_replication_configuration_update_pending(&mut self) {
        match self.reconfig_state.stage() {
            ReconfigurationStage::Phase1GetLsn => {}
            ReconfigurationStage::Phase0Demote
            | ReconfigurationStage::Phase2Catchup
            | ReconfigurationStage::None => {
                self.update_replicator_configuration = true;
            }
            ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate => {
                if self.local_replica().current_configuration_role == ReplicaRole::Primary {
                    self.update_replicator_configuration = true;
                }
            }
            ReconfigurationStage::AbortPhase0Demote => {
                panic!(
                    "replicator configuration update requested during abort {}",
                    self
                );
            }
        }
    }

    fn start_reconfiguration(&mut self, context: &mut ExecutionContext<'_>) {
        self.endpoint_publish_state.clear();
        if self.reconfig_state.stage() == ReconfigurationStage::Phase1GetLsn {
            self.start_phase1_get_lsn(context);
        } else {
            self.start_phase2_catchup(context);
        }
        self.message_retry_active = true;
    }

    /// Direct entry into catchup (Other reconfigurations and the demote
    /// phase of a swap); the failover path enters via the Phase1 finish.
    pub(crate) fn start_phase2_catchup(&mut self, context: &mut ExecutionContext<'_>) {
        self.update_local_state_on_phase2_catchup(context);
        self.process_msg_resends(context);
    }

    pub(crate) fn start_abort_phase0_demote(&mut self, context: &mut ExecutionContext<'_>) {
        self.reconfig_state.start_abort_phase0_demote(context.now);
        self.send_cancel_catchup_message(context);
        self.message_retry_active = true;
    }

    // ----- progress poll (GetLSN) -----

    /// Progress poll received on a (former or prospective) secondary. The
    /// answer comes from the replicator; the sender is remembered until the
    /// proxy replies.
    pub fn process_get_lsn_message(
        &mut self,
        from: NodeInstance,
        body: &ReplicaMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !self.local_replica_open || self.local_replica_close_pending {
            return;
        }
        if body.replica.replica_id != self.local_replica_id
            || body.replica.instance_id != self.local_replica_instance_id
        {
            debug!(unit = %self.fu_desc, "stale progress poll dropped");
            return;
        }
        if body.fu_desc.current_configuration_epoch < self.fu_desc.current_configuration_epoch {
            return;
        }

        if body.fu_desc.current_configuration_epoch != self.fu_desc.current_configuration_epoch {
            // First contact from the new primary's epoch: the current
            // configuration becomes the previous one.
            context.update.enable_update();
            self.copy_cc_to_pc();
            let mut desc = self.fu_desc;
            desc.current_configuration_epoch = body.fu_desc.current_configuration_epoch;
            self.set_failover_unit_description(desc);
        }

        self.sender_node = Some(from);
        self.send_replicator_get_status_message(context);
        self.touch(context.now);
    }

    /// Makes the current configuration the previous one, roles included.
    /// No-op unless the previous configuration is empty and this replica is
    /// part of the current one.
    fn copy_cc_to_pc(&mut self) {
        if self.fu_desc.previous_configuration_epoch.is_valid()
            || !self.local_replica().is_in_current_configuration()
        {
            return;
        }
        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = desc.current_configuration_epoch;
        self.set_failover_unit_description(desc);
        for replica in self.replica_store.iter_mut() {
            replica.previous_configuration_role = replica.current_configuration_role;
        }
    }

    pub(crate) fn send_replicator_get_status_message(
        &self,
        context: &mut ExecutionContext<'_>,
    ) -> bool {
        let body = self.local_replica_message_body();
        let message = if self.local_replica().is_available() {
            // An available replica also moves to the poller's epoch, which
            // fences writes acknowledged under the old primary.
            ProxyMessage::ReplicatorUpdateEpochAndGetStatus(body)
        } else {
            ProxyMessage::ReplicatorGetStatus(body)
        };
        context
            .queue
            .enqueue(StateMachineAction::SendToProxy(message));
        true
    }

    pub fn process_replicator_get_status_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !body.error_code.is_success() {
            return;
        }
        if body.local_replica.replica_id != self.local_replica_id
            || body.local_replica.instance_id != self.local_replica_instance_id
        {
            return;
        }

        if self.reconfig_state.stage() == ReconfigurationStage::Phase1GetLsn {
            self.get_local_replica_lsn_completed(&body.local_replica, context);
            self.touch(context.now);
            return;
        }

        let Some(sender) = self.sender_node else {
            return;
        };
        // Answering the polling primary. A dropped deactivation certificate
        // means this replica was removed and rebuilt with no usable history.
        let error_code = if self.deactivation_info.is_dropped() {
            ErrorCode::NotFound
        } else {
            ErrorCode::Success
        };
        let mut desc = ReplicaDescription::from(self.local_replica());
        desc.first_acknowledged_lsn = body.local_replica.first_acknowledged_lsn;
        desc.last_acknowledged_lsn = body.local_replica.last_acknowledged_lsn;
        desc.deactivation_info = Some(self.deactivation_info);

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: sender,
            message: PeerMessage::GetLsnReply(ReplicaReplyMessageBody {
                fu_desc: self.fu_desc,
                replica: desc,
                error_code,
            }),
        });
        self.sender_node = None;
        self.touch(context.now);
    }

    fn get_local_replica_lsn_completed(
        &mut self,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        let info = self.deactivation_info;
        self.local_replica_mut().set_progress(
            desc.first_acknowledged_lsn,
            desc.last_acknowledged_lsn,
            info,
        );
        self.check_reconfiguration_progress(context);
    }

    pub fn process_get_lsn_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.can_process_get_lsn_reply(body) {
            return;
        }
        debug_assert!(
            self.fu_desc
                .current_configuration_epoch
                .is_primary_epoch_equal(&body.fu_desc.current_configuration_epoch),
            "progress reply from a different primary epoch {}",
            self
        );

        let info = body
            .replica
            .deactivation_info
            .unwrap_or_else(ReplicaDeactivationInfo::empty);
        let mark_dropped = body.replica.is_dropped();
        if let Some(replica) = self.replica_store.get_mut(body.replica.replica_id) {
            replica.message_stage = ReplicaMessageStage::None;
            if body.error_code == ErrorCode::NotFound {
                // The replica exists but has no usable history; it cannot
                // win the election and does not count toward quorum.
                replica.set_lsn_to_unknown();
            } else if mark_dropped {
                context.update.enable_update();
                replica.mark_as_dropped();
            } else {
                replica.set_progress(
                    body.replica.first_acknowledged_lsn,
                    body.replica.last_acknowledged_lsn,
                    info,
                );
            }
        }
        self.check_reconfiguration_progress(context);
        self.touch(context.now);
        self.assert_invariants();
    }

    fn can_process_get_lsn_reply(&self, body: &ReplicaReplyMessageBody) -> bool {
        if body.error_code != ErrorCode::Success && body.error_code != ErrorCode::NotFound {
            return false;
        }
        if self.is_closed() || !self.local_replica_open || self.local_replica_close_pending {
            return false;
        }
        if self.reconfig_state.stage() != ReconfigurationStage::Phase1GetLsn {
            return false;
        }
        let Some(replica) = self.replica_store.get(body.replica.replica_id) else {
            return false;
        };
        replica.message_stage == ReplicaMessageStage::RaReplyPending
            && replica.instance_id == body.replica.instance_id
    }

    // ----- catchup completion -----

    /// Reply from the replicator proxy for an update-configuration command.
    /// The reason the command was sent decides what the reply means.
    pub fn process_update_configuration_reply(
        &mut self,
        reason: UpdateConfigurationReason,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !self.local_replica_open || self.local_replica_close_pending {
            return;
        }

        match reason {
            UpdateConfigurationReason::Catchup => {
                self.process_catchup_completed_reply(body, context);
            }
            UpdateConfigurationReason::Default => {
                if !body.error_code.is_success() {
                    return;
                }
                self.process_replication_configuration_update(reason);

                let local = self.local_replica();
                let promotion_finished = local.previous_configuration_role != ReplicaRole::None
                    && local.current_configuration_role == ReplicaRole::Secondary
                    && !self.reconfig_state.is_reconfiguring();
                if promotion_finished {
                    if let Some(sender) = self.sender_node {
                        // Idle-to-secondary promotion outside a local
                        // reconfiguration: acknowledge the activate now.
                        self.finish_activate_local(&body.local_replica, true, context);
                        self.send_activate_reply(sender, ErrorCode::Success, context);
                    }
                } else if self.reconfig_state.is_reconfiguring() {
                    self.check_reconfiguration_progress(context);
                }
            }
            UpdateConfigurationReason::EndReconfiguration => {
                if !body.error_code.is_success() {
                    return;
                }
                self.process_replication_configuration_update(reason);
                if self.reconfig_state.stage() == ReconfigurationStage::Phase4Activate {
                    self.local_replica_mut().message_stage = ReplicaMessageStage::None;
                    self.check_reconfiguration_progress(context);
                }
            }
        }
        self.touch(context.now);
        self.assert_invariants();
    }

    /// A successful update-configuration acknowledges the configuration that
    /// was current when the command went out; any change since then has
    /// already re-marked the flag.
    fn process_replication_configuration_update(&mut self, reason: UpdateConfigurationReason) {
        if self.reconfig_state.stage() == ReconfigurationStage::Phase0Demote
            && reason == UpdateConfigurationReason::Catchup
        {
            // The demote keeps its update pending until the swap either
            // continues elsewhere or aborts.
            return;
        }
        self.update_replicator_configuration = false;
    }

    fn process_catchup_completed_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        let stage = self.reconfig_state.stage();
        if stage != ReconfigurationStage::Phase0Demote
            && stage != ReconfigurationStage::Phase2Catchup
        {
            debug!(unit = %self.fu_desc, "catchup reply outside catchup dropped");
            return;
        }
        if !self
            .fu_desc
            .current_configuration_epoch
            .is_primary_epoch_equal(&body.fu_desc.current_configuration_epoch)
        {
            return;
        }
        self.catchup_completed(body.error_code, &body.local_replica, context);
    }

    fn catchup_completed(
        &mut self,
        error_code: ErrorCode,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        let state_changed = error_code == ErrorCode::StateChangedOnDataLoss;
        if !error_code.is_success() && !state_changed {
            debug!(unit = %self.fu_desc, error = %error_code, "catchup failed; waiting for retry");
            return;
        }

        context.update.enable_update();
        self.process_replication_configuration_update(UpdateConfigurationReason::Catchup);

        let primary_change = self.is_primary_change_between_pc_and_cc();
        if primary_change {
            // The replicator completed the promotion during catchup; the
            // local replica is serving now.
            self.update_local_replica_endpoints(desc, context);
            self.local_replica_mut().state = ReplicaState::Ready;
        }

        if self.reconfig_state.stage() == ReconfigurationStage::Phase0Demote {
            self.finish_swap_primary(context);
            self.send_continue_swap_primary_message(None, context);
            self.touch(context.now);
            self.assert_invariants();
            return;
        }

        if primary_change && desc.last_acknowledged_lsn != INVALID_LSN {
            // Everything up to this point is quorum-certified under the new
            // epoch; secondaries must reach it before their acknowledged
            // progress can be trusted again.
            self.deactivation_info = ReplicaDeactivationInfo::new(
                self.fu_desc.current_configuration_epoch,
                desc.last_acknowledged_lsn,
            );
        }

        if state_changed {
            // The data-loss catchup discarded acknowledged operations; every
            // ready configuration remote holds state that never existed and
            // must restart.
            let local_id = self.local_replica_id;
            for replica in self.replica_store.iter_mut() {
                if replica.replica_id != local_id
                    && replica.is_up
                    && replica.is_in_configuration()
                    && replica.is_ready()
                {
                    replica.to_be_restarted = true;
                }
            }
        }

        self.start_phase3_deactivate(context);
        self.touch(context.now);
        self.assert_invariants();
    }

    pub(crate) fn update_local_replica_endpoints(
        &mut self,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        let local = self.local_replica_mut();
        if local.service_location == desc.service_location
            && local.replication_endpoint == desc.replication_endpoint
        {
            return;
        }
        local.service_location = desc.service_location.clone();
        local.replication_endpoint = desc.replication_endpoint.clone();
        self.endpoint_publish_state.on_endpoint_updated(
            context.now,
            context.config.max_wait_before_publish_endpoint_duration,
        );
    }

    fn finish_swap_primary(&mut self, context: &mut ExecutionContext<'_>) {
        context.update.enable_update();
        let durations = self.reconfig_state.finish_demote(context.now);
        self.enqueue_reconfiguration_complete_trace(durations, context);

        for replica in self.replica_store.iter_mut() {
            if replica.to_be_deactivated {
                debug_assert!(
                    replica.message_stage == ReplicaMessageStage::None
                        && !replica.to_be_activated,
                    "deactivate pending past the demote {}",
                    replica
                );
                replica.to_be_deactivated = false;
            }
        }
        info!(unit = %self.fu_desc, "demote completed; swap continues on the new primary");
    }

    fn send_continue_swap_primary_message(
        &self,
        incoming: Option<&DoReconfigurationMessageBody>,
        context: &mut ExecutionContext<'_>,
    ) {
        let fu_desc = incoming.map(|b| b.fu_desc).unwrap_or(self.fu_desc);
        let Some(phase0_duration) = self.reconfig_state.phase0_duration() else {
            debug_assert!(false, "continue swap without a measured demote {}", self);
            return;
        };
        context
            .queue
            .enqueue(StateMachineAction::SendToFm(FmMessage::ContinueSwapPrimary {
                body: ConfigurationReplyMessageBody {
                    fu_desc,
                    error_code: ErrorCode::Success,
                },
                phase0_duration,
            }));
    }

    // ----- abort of a demote -----

    pub fn process_cancel_catchup_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed()
            || self.reconfig_state.stage() != ReconfigurationStage::AbortPhase0Demote
        {
            return;
        }
        if body.fu_desc.current_configuration_epoch != self.fu_desc.current_configuration_epoch {
            return;
        }
        self.cancel_catchup_completed(body.error_code, context);
        self.touch(context.now);
        self.assert_invariants();
    }

    fn cancel_catchup_completed(
        &mut self,
        error_code: ErrorCode,
        context: &mut ExecutionContext<'_>,
    ) {
        self.fm_message_state.reset();
        self.update_replicator_configuration = false;

        if error_code.is_success() {
            context.update.enable_update();
            let durations = self.reconfig_state.finish_abort_swap_primary(context.now);
            self.enqueue_reconfiguration_complete_trace(durations, context);
            self.revert_configuration();
            info!(unit = %self.fu_desc, "swap aborted; this replica remains primary");
        } else if error_code == ErrorCode::DemoteCompleted {
            // The demote finished before the cancel reached the replicator;
            // the swap proceeds on the new primary after all.
            context.update.enable_update();
            let durations = self.reconfig_state.finish_demote(context.now);
            self.enqueue_reconfiguration_complete_trace(durations, context);
        }
    }

    // ----- deactivation and activation phases (primary side) -----

    pub(crate) fn start_phase3_deactivate(&mut self, context: &mut ExecutionContext<'_>) {
        if self.should_skip_phase3_deactivate(context) {
            self.start_phase4_activate(context);
            return;
        }

        context.update.enable_update();
        self.reconfig_state.start_phase3_deactivate(context.now);
        let mut desc = self.fu_desc;
        desc.intermediate_configuration_epoch = desc.current_configuration_epoch;
        self.set_failover_unit_description(desc);

        self.update_state_at_phase3_deactivate();
        self.process_msg_resends(context);
        self.check_reconfiguration_progress(context);
    }

    /// Deactivation only fences replicas that are leaving; when the two
    /// memberships are identical the activates carry the epoch change alone.
    fn should_skip_phase3_deactivate(&self, context: &ExecutionContext<'_>) -> bool {
        context.config.enable_phase3_phase4_in_parallel
            && self
                .replica_store
                .iter()
                .all(|r| r.is_in_previous_configuration() == r.is_in_current_configuration())
    }

    fn update_state_at_phase3_deactivate(&mut self) {
        let local_id = self.local_replica_id;
        for replica in self.replica_store.iter_mut() {
            replica.intermediate_configuration_role = replica.current_configuration_role;
            if replica.replica_id == local_id {
                continue;
            }
            if replica.is_in_previous_configuration() && !replica.is_dropped() {
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
        }
    }

    pub(crate) fn start_phase4_activate(&mut self, context: &mut ExecutionContext<'_>) {
        context.update.enable_update();
        let mut desc = self.fu_desc;
        desc.intermediate_configuration_epoch = desc.current_configuration_epoch;
        self.set_failover_unit_description(desc);
        self.reconfig_state.start_phase4_activate(context.now);

        self.update_state_at_phase4_activate();
        if self.local_replica().current_configuration_role == ReplicaRole::Primary {
            self.local_replica_mut().message_stage = ReplicaMessageStage::RaProxyReplyPending;
        }

        self.process_msg_resends(context);
        self.check_reconfiguration_progress(context);
    }

    fn update_state_at_phase4_activate(&mut self) {
        let local_id = self.local_replica_id;
        for replica in self.replica_store.iter_mut() {
            replica.intermediate_configuration_role = replica.current_configuration_role;
            if replica.replica_id == local_id {
                continue;
            }
            replica.message_stage = ReplicaMessageStage::None;
            if replica.is_in_current_configuration() && !replica.is_dropped() {
                if replica.is_in_build() && replica.to_be_deactivated {
                    // Its certified deactivation now rides on the activate.
                    replica.to_be_deactivated = false;
                    replica.to_be_activated = true;
                }
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
        }
    }

    fn finish_phase3_deactivate(&mut self, context: &mut ExecutionContext<'_>) {
        self.start_phase4_activate(context);
    }

    fn finish_phase4_activate(&mut self, context: &mut ExecutionContext<'_>) {
        context.update.enable_update();
        self.reset_reconfiguration_states();
        let durations = self.reconfig_state.finish(context.now);
        self.enqueue_reconfiguration_complete_trace(durations, context);

        if self.endpoint_publish_state.on_reconfiguration_finished() {
            self.fm_message_state.on_endpoint_available();
            self.message_retry_active = true;
        }

        self.send_do_reconfiguration_reply(context);
        info!(unit = %self.fu_desc, "reconfiguration completed");
    }

    pub(crate) fn send_do_reconfiguration_reply(&self, context: &mut ExecutionContext<'_>) {
        context.queue.enqueue(StateMachineAction::SendToFm(
            FmMessage::DoReconfigurationReply(ConfigurationReplyMessageBody {
                fu_desc: self.fu_desc,
                error_code: ErrorCode::Success,
            }),
        ));
    }

    // ----- progress dispatch -----

    /// Evaluates whether the current phase can finish and drives the
    /// transition when it can. Also emits the stuck-reconfiguration
    /// diagnostics.
    pub(crate) fn check_reconfiguration_progress(&mut self, context: &mut ExecutionContext<'_>) {
        match self.reconfig_state.stage() {
            ReconfigurationStage::Phase1GetLsn => {
                if self.check_phase1_get_lsn_progress(context) {
                    if let Some(primary) = self.try_find_primary(context.config) {
                        self.finish_phase1_get_lsn(primary, context);
                    }
                }
            }
            ReconfigurationStage::Phase0Demote
            | ReconfigurationStage::Phase2Catchup
            | ReconfigurationStage::AbortPhase0Demote => {
                // Waiting on the replicator proxy.
            }
            ReconfigurationStage::Phase3Deactivate => {
                if self.check_phase3_deactivate_progress() {
                    self.finish_phase3_deactivate(context);
                }
            }
            ReconfigurationStage::Phase4Activate => match self.check_phase4_activate_progress() {
                ActivateProgress::Done => self.finish_phase4_activate(context),
                ActivateProgress::PendingActivateReplies => {}
                _ => {
                    if self.local_replica().message_stage
                        == ReplicaMessageStage::RaProxyReplyPending
                    {
                        self.send_end_reconfiguration_message(context);
                    }
                }
            },
            ReconfigurationStage::None => {}
        }

        self.report_reconfiguration_slow_if_needed(context);
    }

    fn report_reconfiguration_slow_if_needed(&self, context: &mut ExecutionContext<'_>) {
        if !self.reconfig_state.is_reconfiguring() {
            return;
        }
        let elapsed = self.reconfig_state.phase_elapsed(context.now);
        if elapsed >= context.config.reconfiguration_health_report_threshold {
            self.enqueue_health_event(
                ReplicaHealthEvent::Warning,
                format!(
                    "reconfiguration stuck in {} for {:?}",
                    self.reconfig_state.stage(),
                    elapsed
                ),
                context,
            );
        }
        if elapsed >= context.config.service_reconfiguration_api_trace_warning_threshold {
            context
                .queue
                .enqueue(StateMachineAction::Trace(TraceRecord::ReconfigurationSlow {
                    id: self.id(),
                    stage: self.reconfig_state.stage().to_string(),
                    detail: format!("phase running for {:?}", elapsed),
                }));
        }
    }

    // ----- deactivate/activate replies (primary side) -----

    pub fn process_deactivate_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !body.error_code.is_success() {
            return;
        }
        let has_persisted = self.has_persisted_state();
        let stage = self.reconfig_state.stage();
        let replica_id = body.replica.replica_id;

        let Some(replica) = self.replica_store.get(replica_id) else {
            return;
        };
        if replica.instance_id != body.replica.instance_id {
            debug!(unit = %self.fu_desc, "stale deactivate reply dropped");
            return;
        }
        let to_be_restarted = replica.to_be_restarted;
        let in_build_deactivating = replica.is_in_build() && replica.to_be_deactivated;
        let phase3_state_ok =
            replica.is_standby() || in_build_deactivating || replica.is_ready();
        let reply_pending = replica.message_stage == ReplicaMessageStage::RaReplyPending;

        if to_be_restarted && stage != ReconfigurationStage::None {
            if has_persisted {
                // A persisted replica restarts in place and reports back up
                // through the manager; nothing to record from the reply.
                return;
            }
            context.update.enable_update();
            if let Some(replica) = self.replica_store.get_mut(replica_id) {
                replica.mark_as_dropped();
            }
            self.check_reconfiguration_progress(context);
            self.touch(context.now);
            self.assert_invariants();
            return;
        }

        match stage {
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::Phase2Catchup => {
                if !in_build_deactivating {
                    return;
                }
                context.update.enable_update();
                self.finish_deactivation_info_update(replica_id, context);
                self.check_reconfiguration_progress(context);
            }
            ReconfigurationStage::Phase3Deactivate => {
                if !phase3_state_ok || !reply_pending {
                    return;
                }
                context.update.enable_update();
                if in_build_deactivating {
                    self.finish_deactivation_info_update(replica_id, context);
                }
                if let Some(replica) = self.replica_store.get_mut(replica_id) {
                    replica.message_stage = ReplicaMessageStage::None;
                }
                self.check_reconfiguration_progress(context);
            }
            _ => return,
        }

        self.touch(context.now);
        self.assert_invariants();
    }

    pub fn process_activate_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !body.error_code.is_success() {
            return;
        }
        let stage = self.reconfig_state.stage();
        if stage != ReconfigurationStage::Phase4Activate && stage != ReconfigurationStage::None {
            return;
        }
        let replica_id = body.replica.replica_id;
        let Some(replica) = self.replica_store.get(replica_id) else {
            return;
        };
        if replica.instance_id != body.replica.instance_id
            || replica.message_stage != ReplicaMessageStage::RaReplyPending
        {
            return;
        }

        // The reported state must be a plausible successor of the stored
        // one; anything else is a reply to an older activate.
        let stale = match replica.state {
            ReplicaState::Dropped | ReplicaState::InCreate | ReplicaState::InDrop => true,
            ReplicaState::Ready => body.replica.state != ReplicaState::Ready,
            ReplicaState::StandBy => !matches!(
                body.replica.state,
                ReplicaState::StandBy | ReplicaState::InBuild
            ),
            ReplicaState::InBuild => {
                !replica.to_be_activated || body.replica.state != ReplicaState::Ready
            }
        };
        if stale {
            debug!(unit = %self.fu_desc, "stale activate reply dropped");
            return;
        }
        let was_in_build = replica.is_in_build();

        context.update.enable_update();
        if let Some(replica) = self.replica_store.get_mut(replica_id) {
            if body.replica.current_configuration_role != ReplicaRole::None {
                replica.service_location = body.replica.service_location.clone();
                replica.replication_endpoint = body.replica.replication_endpoint.clone();
            }
            replica.message_stage = ReplicaMessageStage::None;
        }

        if was_in_build {
            self.finish_deactivation_info_update(replica_id, context);
        }
        let still_to_be_activated = self
            .replica_store
            .get(replica_id)
            .map(|r| r.to_be_activated)
            .unwrap_or(false);
        if still_to_be_activated {
            self.touch(context.now);
            return;
        }

        if stage == ReconfigurationStage::Phase4Activate {
            self.check_reconfiguration_progress(context);
        } else {
            self.send_add_replica_reply(replica_id, context);
        }
        self.touch(context.now);
        self.assert_invariants();
    }

    /// An in-build replica confirmed its certified deactivation point; it is
    /// a full member of the replica set from here on.
    pub(crate) fn finish_deactivation_info_update(
        &mut self,
        replica_id: i64,
        context: &mut ExecutionContext<'_>,
    ) {
        let stage = self.reconfig_state.stage();
        if let Some(replica) = self.replica_store.get_mut(replica_id) {
            debug_assert!(
                replica.is_in_build(),
                "deactivation info confirmed for a replica not in build {}",
                replica
            );
            match stage {
                ReconfigurationStage::Phase0Demote
                | ReconfigurationStage::Phase2Catchup
                | ReconfigurationStage::Phase3Deactivate => replica.to_be_deactivated = false,
                ReconfigurationStage::Phase4Activate | ReconfigurationStage::None => {
                    replica.to_be_activated = false
                }
                ReconfigurationStage::Phase1GetLsn | ReconfigurationStage::AbortPhase0Demote => {
                    debug_assert!(false, "build completion in {}", stage);
                }
            }
            replica.state = ReplicaState::Ready;
        }
        self.mark_replication_configuration_update_pending();
        self.send_update_replicator_configuration_message(context);
    }

    fn send_add_replica_reply(&self, replica_id: i64, context: &mut ExecutionContext<'_>) {
        let Some(replica) = self.replica_store.get(replica_id) else {
            return;
        };
        context
            .queue
            .enqueue(StateMachineAction::SendToFm(FmMessage::AddReplicaReply(
                ReplicaReplyMessageBody {
                    fu_desc: self.fu_desc,
                    replica: ReplicaDescription::from(replica),
                    error_code: ErrorCode::Success,
                },
            )));
    }

    // ----- deactivate processing (secondary side) -----

    pub fn process_deactivate_message(
        &mut self,
        from: NodeInstance,
        body: &ConfigurationMessageBody,
        deactivation_info: ReplicaDeactivationInfo,
        is_force: bool,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() {
            self.acknowledge_on_closed_unit(from, body, false, context);
            return;
        }
        if !self.local_replica_open || self.local_replica_close_pending {
            return;
        }
        let Some(cc_replica) = body.replica(self.local_replica_id) else {
            debug!(unit = %self.fu_desc, "deactivate without the local replica dropped");
            return;
        };
        if cc_replica.instance_id != self.local_replica_instance_id {
            return;
        }

        if is_force {
            // Restart demanded by the primary: acknowledged LSNs past the
            // certified catchup point may be false progress.
            let mode = if self.has_persisted_state() {
                ReplicaCloseMode::Restart
            } else {
                ReplicaCloseMode::Deactivate
            };
            self.start_close_local_replica(mode, Some(from), context);
            return;
        }

        if !body.fu_desc.previous_configuration_epoch.is_valid()
            && body.fu_desc.current_configuration_epoch == self.fu_desc.current_configuration_epoch
            && self.local_replica().is_in_configuration()
        {
            // Duplicate of a view this replica already holds.
            return;
        }
        if self.is_configuration_message_body_stale(body) {
            return;
        }

        self.update_deactivation_info(
            body.fu_desc.current_configuration_epoch,
            cc_replica,
            Some(deactivation_info),
            context,
        );

        let update_state = {
            let local = self.local_replica();
            (local.is_standby()
                || local.previous_configuration_role == ReplicaRole::None
                || self.fu_desc.intermediate_configuration_epoch
                    < body.fu_desc.current_configuration_epoch)
                && cc_replica.previous_configuration_role > ReplicaRole::Idle
        };

        if update_state {
            self.start_deactivate(body, context);
        }

        if cc_replica.current_configuration_role == ReplicaRole::None {
            // Removed from the configuration entirely; close without a
            // reply, the drop will be reported through the manager.
            self.start_close_local_replica(ReplicaCloseMode::Deactivate, Some(from), context);
            return;
        }

        if update_state {
            self.finish_deactivate(cc_replica);
        }

        context.queue.enqueue(StateMachineAction::SendToPeer {
            target: from,
            message: PeerMessage::DeactivateReply(ReplicaReplyMessageBody {
                fu_desc: self.fu_desc,
                replica: ReplicaDescription::from(self.local_replica()),
                error_code: ErrorCode::Success,
            }),
        });
        self.touch(context.now);
        self.assert_invariants();
    }

    fn start_deactivate(
        &mut self,
        body: &ConfigurationMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        context.update.enable_update();
        self.refresh_configuration(body, false);
        let mut desc = self.fu_desc;
        desc.intermediate_configuration_epoch = body.fu_desc.current_configuration_epoch;
        self.set_failover_unit_description(desc);
    }

    fn finish_deactivate(&mut self, cc_replica: &ReplicaDescription) {
        if cc_replica.current_configuration_role >= ReplicaRole::Secondary {
            return;
        }
        // Demoted out of the configuration (kept only as an idle replica);
        // no activate will follow, so the views collapse now.
        debug_assert!(
            cc_replica.current_configuration_role == ReplicaRole::Idle,
            "deactivate finishing with role {}",
            cc_replica.current_configuration_role
        );
        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = Epoch::invalid();
        desc.intermediate_configuration_epoch = Epoch::invalid();
        self.set_failover_unit_description(desc);

        let local = self.local_replica_mut();
        local.previous_configuration_role = ReplicaRole::None;
        local.intermediate_configuration_role = ReplicaRole::None;
        self.reconfig_state.reset();

        let local_id = self.local_replica_id;
        self.replica_store
            .retain(|r| r.replica_id == local_id || !r.is_in_configuration());
    }

    // ----- activate processing (secondary side) -----

    pub fn process_activate_message(
        &mut self,
        from: NodeInstance,
        body: &ConfigurationMessageBody,
        deactivation_info: ReplicaDeactivationInfo,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() {
            self.acknowledge_on_closed_unit(from, body, true, context);
            return;
        }
        if !self.local_replica_open || self.local_replica_close_pending {
            return;
        }
        let Some(cc_replica) = body.replica(self.local_replica_id) else {
            debug!(unit = %self.fu_desc, "activate without the local replica dropped");
            return;
        };
        if cc_replica.instance_id != self.local_replica_instance_id {
            return;
        }

        if self.local_replica().message_stage == ReplicaMessageStage::RaProxyReplyPending {
            // The replicator has not applied the previous activate yet;
            // remember the (possibly new) sender and push the proxy again.
            self.sender_node = Some(from);
            self.send_update_configuration_message(UpdateConfigurationReason::Default, context);
            return;
        }

        if body.fu_desc.current_configuration_epoch == self.fu_desc.current_configuration_epoch
            && body.fu_desc.previous_configuration_epoch
                < self.fu_desc.previous_configuration_epoch
            && cc_replica.state == ReplicaState::StandBy
            && !self.local_replica().is_standby()
        {
            // Reordered activate from before this replica was rebuilt.
            return;
        }
        if self.is_configuration_message_body_stale(body) {
            return;
        }

        self.update_deactivation_info(
            body.fu_desc.current_configuration_epoch,
            cc_replica,
            Some(deactivation_info),
            context,
        );

        let needs_update = {
            let local = self.local_replica();
            local.is_standby()
                || body.fu_desc.current_configuration_epoch
                    > self.fu_desc.current_configuration_epoch
                || (cc_replica.current_configuration_role >= ReplicaRole::Secondary
                    && (local.current_configuration_role != cc_replica.current_configuration_role
                        || local.previous_configuration_role != ReplicaRole::None))
        };

        if needs_update {
            let previous_role = self.local_replica().current_configuration_role;
            self.start_activate(body, context);

            let role_changed = previous_role != cc_replica.current_configuration_role;
            if role_changed && cc_replica.state != ReplicaState::StandBy {
                // The replicator must apply the role change before the
                // activate can be acknowledged.
                self.local_replica_mut().message_stage = ReplicaMessageStage::RaProxyReplyPending;
                self.sender_node = Some(from);
                self.send_update_configuration_message(UpdateConfigurationReason::Default, context);
                self.touch(context.now);
                self.assert_invariants();
                return;
            }
            self.finish_activate_local(cc_replica, false, context);
        }

        self.send_activate_reply(from, ErrorCode::Success, context);
        self.touch(context.now);
        self.assert_invariants();
    }

    fn start_activate(
        &mut self,
        body: &ConfigurationMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        context.update.enable_update();
        self.refresh_configuration(body, true);
        let mut desc = self.fu_desc;
        desc.intermediate_configuration_epoch = Epoch::invalid();
        self.set_failover_unit_description(desc);
    }

    pub(crate) fn finish_activate_local(
        &mut self,
        desc: &ReplicaDescription,
        update_endpoints: bool,
        context: &mut ExecutionContext<'_>,
    ) {
        self.local_replica_mut().message_stage = ReplicaMessageStage::None;
        if update_endpoints {
            self.update_local_replica_endpoints(desc, context);
        }
        self.reset_reconfiguration_states();
        self.sender_node = None;
    }

    fn send_activate_reply(
        &self,
        target: NodeInstance,
        error_code: ErrorCode,
        context: &mut ExecutionContext<'_>,
    ) {
        context.queue.enqueue(StateMachineAction::SendToPeer {
            target,
            message: PeerMessage::ActivateReply(ReplicaReplyMessageBody {
                fu_desc: self.fu_desc,
                replica: ReplicaDescription::from(self.local_replica()),
                error_code,
            }),
        });
    }

    /// A deactivate/activate for a unit this node no longer hosts is
    /// acknowledged with the incoming view so the primary can finish.
    fn acknowledge_on_closed_unit(
        &mut self,
        from: NodeInstance,
        body: &ConfigurationMessageBody,
        is_activate: bool,
        context: &mut ExecutionContext<'_>,
    ) {
        if body.fu_desc.current_configuration_epoch > self.fu_desc.current_configuration_epoch {
            context.update.enable_update();
            let mut desc = self.fu_desc;
            desc.current_configuration_epoch = body.fu_desc.current_configuration_epoch;
            self.set_failover_unit_description(desc);
            self.touch(context.now);
        }
        let Some(replica) = body
            .replicas
            .iter()
            .find(|r| r.node.id == context.node_instance.id)
        else {
            return;
        };
        let mut replica = replica.clone();
        replica.state = ReplicaState::Dropped;
        replica.is_up = false;
        let reply = ReplicaReplyMessageBody {
            fu_desc: body.fu_desc,
            replica,
            error_code: ErrorCode::Success,
        };
        let message = if is_activate {
            PeerMessage::ActivateReply(reply)
        } else {
            PeerMessage::DeactivateReply(reply)
        };
        context
            .queue
            .enqueue(StateMachineAction::SendToPeer { target: from, message });
    }

    // ----- shared view maintenance (secondary side) -----

    /// Rebuilds the configuration view from an incoming deactivate/activate.
    /// A request without a previous configuration (idle promotion) uses the
    /// incoming current configuration for both views.
    fn refresh_configuration(&mut self, body: &ConfigurationMessageBody, reset_intermediate: bool) {
        let use_incoming_cc_as_pc = !body.fu_desc.previous_configuration_epoch.is_valid();
        let local_id = self.local_replica_id;

        self.replica_store
            .retain(|r| r.replica_id == local_id || !r.is_in_configuration());

        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = if use_incoming_cc_as_pc {
            body.fu_desc.current_configuration_epoch
        } else {
            body.fu_desc.previous_configuration_epoch
        };
        desc.current_configuration_epoch = body.fu_desc.current_configuration_epoch;
        self.set_failover_unit_description(desc);

        for incoming in &body.replicas {
            if incoming.replica_id == local_id
                || self.replica_store.get(incoming.replica_id).is_some()
            {
                continue;
            }
            let pc_role = if use_incoming_cc_as_pc {
                incoming.current_configuration_role
            } else {
                incoming.previous_configuration_role
            };
            if pc_role < ReplicaRole::Secondary
                && incoming.current_configuration_role < ReplicaRole::Secondary
            {
                continue;
            }
            let mut replica = Replica::new(incoming.replica_id, incoming.instance_id, incoming.node);
            replica.previous_configuration_role = pc_role;
            replica.current_configuration_role = incoming.current_configuration_role;
            replica.intermediate_configuration_role = if reset_intermediate {
                ReplicaRole::None
            } else {
                incoming.current_configuration_role
            };
            replica.state = incoming.state;
            replica.is_up = incoming.is_up;
            replica.service_location = incoming.service_location.clone();
            replica.replication_endpoint = incoming.replication_endpoint.clone();
            self.replica_store.add(replica);
        }

        if let Some(incoming_local) = body.replica(local_id) {
            debug_assert!(
                incoming_local.state != ReplicaState::Dropped,
                "refresh from a view that drops the local replica {}",
                self
            );
            let keep_cc_role = {
                let local = self.local_replica();
                local.current_configuration_role == ReplicaRole::Idle
                    && local.is_in_previous_configuration()
                    && !reset_intermediate
            };
            let local = self.local_replica_mut();
            local.previous_configuration_role = if use_incoming_cc_as_pc {
                incoming_local.current_configuration_role
            } else {
                incoming_local.previous_configuration_role
            };
            local.state = incoming_local.state;
            local.intermediate_configuration_role = if reset_intermediate {
                ReplicaRole::None
            } else {
                incoming_local.current_configuration_role
            };
            if !keep_cc_role {
                local.current_configuration_role = incoming_local.current_configuration_role;
            }
        }
    }

    /// A view naming an instance older than one this node has seen is from
    /// the past.
    fn is_configuration_message_body_stale(&self, body: &ConfigurationMessageBody) -> bool {
        body.replicas.iter().any(|incoming| {
            self.replica_store
                .get(incoming.replica_id)
                .map_or(false, |known| known.instance_id > incoming.instance_id)
        })
    }

    /// Adopts an incoming deactivation certificate if it is strictly newer
    /// than the held one. Senders that predate the certificate are handled
    /// by synthesizing one from the epoch and LSN they do send.
    fn update_deactivation_info(
        &mut self,
        incoming_cc_epoch: Epoch,
        incoming_local: &ReplicaDescription,
        incoming_info: Option<ReplicaDeactivationInfo>,
        context: &mut ExecutionContext<'_>,
    ) {
        debug_assert_eq!(incoming_local.replica_id, self.local_replica_id);
        if incoming_local.state != ReplicaState::Ready {
            return;
        }

        let info = match incoming_info {
            Some(info) if info.is_valid() => info,
            _ => {
                if incoming_local.last_acknowledged_lsn == INVALID_LSN {
                    ReplicaDeactivationInfo::empty()
                } else {
                    ReplicaDeactivationInfo::new(
                        incoming_cc_epoch,
                        incoming_local.last_acknowledged_lsn,
                    )
                }
            }
        };

        let newer = match info
            .deactivation_epoch
            .compare_primary(&self.deactivation_info.deactivation_epoch)
        {
            Ordering::Greater => true,
            Ordering::Equal => info.catchup_lsn > self.deactivation_info.catchup_lsn,
            Ordering::Less => false,
        };
        if !newer {
            return;
        }

        context.update.enable_update();
        self.deactivation_info = info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconfigurationConfig;
    use crate::epoch::Epoch;
    use crate::messages::{FailoverUnitId, ServiceDescription};
    use crate::test_support::{self, TestHost};

    fn swap_body(unit: &FailoverUnit, new_primary: i64) -> DoReconfigurationMessageBody {
        let mut replicas: Vec<ReplicaDescription> = unit
            .replicas()
            .map(ReplicaDescription::from)
            .collect();
        for desc in &mut replicas {
            desc.previous_configuration_role = desc.current_configuration_role;
            if desc.replica_id == unit.local_replica_id() {
                desc.current_configuration_role = ReplicaRole::Secondary;
            } else if desc.replica_id == new_primary {
                desc.current_configuration_role = ReplicaRole::Primary;
            }
        }
        let mut fu_desc = *unit.description();
        fu_desc.previous_configuration_epoch = fu_desc.current_configuration_epoch;
        fu_desc.current_configuration_epoch =
            Epoch::new(fu_desc.current_configuration_epoch.configuration_version + 1, 0);
        DoReconfigurationMessageBody {
            fu_desc,
            service_desc: unit.service_description().clone(),
            replicas,
            phase0_duration: None,
        }
    }

    #[test]
    fn test_swap_request_enters_demote() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_primary_with_secondaries(&[2, 3]);

        let body = swap_body(&unit, 2);
        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));

        assert_eq!(
            unit.reconfiguration_stage(),
            ReconfigurationStage::Phase0Demote
        );
        assert!(unit.reconfiguration_state().is_swap_primary());
    }

    #[test]
    fn test_continued_swap_enters_get_lsn() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_secondary_with_peers(&[2, 3]);

        let mut body = swap_body(&unit, unit.local_replica_id());
        for desc in &mut body.replicas {
            desc.previous_configuration_role = if desc.replica_id == 2 {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            desc.current_configuration_role = if desc.replica_id == unit.local_replica_id() {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
        }
        body.phase0_duration = Some(std::time::Duration::from_secs(2));

        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));

        assert_eq!(
            unit.reconfiguration_stage(),
            ReconfigurationStage::Phase1GetLsn
        );
        assert!(unit.reconfiguration_state().is_swap_primary());
    }

    #[test]
    fn test_membership_change_without_primary_change_is_other() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_primary_with_secondaries(&[2, 3]);

        let mut body = swap_body(&unit, unit.local_replica_id());
        for desc in &mut body.replicas {
            desc.current_configuration_role = desc.previous_configuration_role;
        }
        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));

        assert_eq!(
            unit.reconfiguration_state().reconfig_type(),
            ReconfigurationType::Other
        );
        assert_eq!(
            unit.reconfiguration_stage(),
            ReconfigurationStage::Phase2Catchup
        );
    }

    #[test]
    fn test_retried_completed_request_is_answered_from_result() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_primary_with_secondaries(&[2]);

        let mut body = swap_body(&unit, unit.local_replica_id());
        for desc in &mut body.replicas {
            desc.current_configuration_role = desc.previous_configuration_role;
        }
        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));

        // Complete the catchup and both remaining phases.
        let catchup_reply = ProxyReplyMessageBody {
            fu_desc: *unit.description(),
            local_replica: ReplicaDescription::from(unit.local_replica()),
            error_code: ErrorCode::Success,
        };
        host.call(|ctx| {
            unit.process_update_configuration_reply(
                UpdateConfigurationReason::Catchup,
                &catchup_reply,
                ctx,
            )
        });
        for id in [2i64] {
            let reply = ReplicaReplyMessageBody {
                fu_desc: *unit.description(),
                replica: ReplicaDescription::from(
                    unit.replicas().find(|r| r.replica_id == id).unwrap(),
                ),
                error_code: ErrorCode::Success,
            };
            host.call(|ctx| unit.process_deactivate_reply(&reply, ctx));
            let reply = ReplicaReplyMessageBody {
                fu_desc: *unit.description(),
                replica: ReplicaDescription::from(
                    unit.replicas().find(|r| r.replica_id == id).unwrap(),
                ),
                error_code: ErrorCode::Success,
            };
            host.call(|ctx| unit.process_activate_reply(&reply, ctx));
        }
        let end_reply = ProxyReplyMessageBody {
            fu_desc: *unit.description(),
            local_replica: ReplicaDescription::from(unit.local_replica()),
            error_code: ErrorCode::Success,
        };
        host.call(|ctx| {
            unit.process_update_configuration_reply(
                UpdateConfigurationReason::EndReconfiguration,
                &end_reply,
                ctx,
            )
        });
        assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
        assert_eq!(
            unit.reconfiguration_state().result(),
            ReconfigurationResult::Completed
        );

        // The manager retries; the reply is resent without re-running
        // anything.
        let actions = host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
        assert!(actions.iter().any(|a| matches!(
            a,
            StateMachineAction::SendToFm(FmMessage::DoReconfigurationReply(_))
        )));
        assert_eq!(unit.reconfiguration_stage(), ReconfigurationStage::None);
    }

    #[test]
    fn test_get_lsn_reply_not_found_marks_unknown() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_secondary_with_peers(&[2, 3]);
        let body = test_support::failover_body(&unit);
        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
        assert_eq!(
            unit.reconfiguration_stage(),
            ReconfigurationStage::Phase1GetLsn
        );

        let reply = ReplicaReplyMessageBody {
            fu_desc: *unit.description(),
            replica: ReplicaDescription::from(
                unit.replicas().find(|r| r.replica_id == 2).unwrap(),
            ),
            error_code: ErrorCode::NotFound,
        };
        host.call(|ctx| unit.process_get_lsn_reply(&reply, ctx));

        let replica = unit.replicas().find(|r| r.replica_id == 2).unwrap();
        assert!(replica.is_lsn_unknown());
        assert_eq!(replica.message_stage, ReplicaMessageStage::None);
    }

    #[test]
    fn test_secondary_answers_get_lsn_via_replicator() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_secondary_with_peers(&[2, 3]);

        let mut fu_desc = *unit.description();
        fu_desc.current_configuration_epoch =
            Epoch::new(fu_desc.current_configuration_epoch.configuration_version + 1, 0);
        let poll = ReplicaMessageBody {
            fu_desc,
            replica: ReplicaDescription::new(
                unit.local_replica().node,
                unit.local_replica_id(),
                unit.local_replica_instance_id(),
            ),
            service_desc: unit.service_description().clone(),
        };
        let from = NodeInstance::new(2, 1);
        let actions = host.call(|ctx| unit.process_get_lsn_message(from, &poll, ctx));

        // CC moved to the poller's epoch and the old CC became PC.
        assert_eq!(
            unit.current_configuration_epoch(),
            fu_desc.current_configuration_epoch
        );
        assert!(unit.previous_configuration_epoch().is_valid());
        assert!(actions.iter().any(|a| matches!(
            a,
            StateMachineAction::SendToProxy(ProxyMessage::ReplicatorUpdateEpochAndGetStatus(_))
        )));

        // The proxy answers; the reply goes back to the poller.
        let status = ProxyReplyMessageBody {
            fu_desc: *unit.description(),
            local_replica: ReplicaDescription::from(unit.local_replica()),
            error_code: ErrorCode::Success,
        };
        let actions = host.call(|ctx| unit.process_replicator_get_status_reply(&status, ctx));
        assert!(actions.iter().any(|a| matches!(
            a,
            StateMachineAction::SendToPeer {
                message: PeerMessage::GetLsnReply(_),
                ..
            }
        )));
    }

    #[test]
    fn test_deactivation_info_only_moves_forward() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_secondary_with_peers(&[2]);
        let epoch = unit.current_configuration_epoch();

        let mut desc = ReplicaDescription::from(unit.local_replica());
        desc.state = ReplicaState::Ready;
        desc.last_acknowledged_lsn = 50;

        host.call(|ctx| {
            unit.update_deactivation_info(
                epoch,
                &desc,
                Some(ReplicaDeactivationInfo::new(epoch, 40)),
                ctx,
            )
        });
        assert_eq!(unit.deactivation_info().catchup_lsn, 40);

        // An older certificate is ignored.
        host.call(|ctx| {
            unit.update_deactivation_info(
                epoch,
                &desc,
                Some(ReplicaDeactivationInfo::new(epoch, 30)),
                ctx,
            )
        });
        assert_eq!(unit.deactivation_info().catchup_lsn, 40);
    }

    #[test]
    fn test_deactivation_info_synthesized_for_old_senders() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_secondary_with_peers(&[2]);
        let epoch = Epoch::new(
            unit.current_configuration_epoch().configuration_version + 1,
            0,
        );

        let mut desc = ReplicaDescription::from(unit.local_replica());
        desc.state = ReplicaState::Ready;
        desc.last_acknowledged_lsn = 17;
        desc.deactivation_info = None;

        host.call(|ctx| unit.update_deactivation_info(epoch, &desc, None, ctx));
        assert_eq!(unit.deactivation_info().deactivation_epoch, epoch);
        assert_eq!(unit.deactivation_info().catchup_lsn, 17);
    }

    #[test]
    fn test_closed_unit_acknowledges_deactivate() {
        let mut host = TestHost::new();
        let service = ServiceDescription::new("svc", "Echo", 3, 2, true);
        let mut unit = FailoverUnit::new(FailoverUnitId::new_random(), service.clone());

        let node = test_support::LOCAL_NODE;
        let mut desc = ReplicaDescription::new(node, 9, 9);
        desc.current_configuration_role = ReplicaRole::Secondary;
        let body = ConfigurationMessageBody {
            fu_desc: crate::messages::FailoverUnitDescription::new(
                FailoverUnitId::new_random(),
                Epoch::new(3, 0),
            ),
            service_desc: service,
            replicas: vec![desc],
        };
        let from = NodeInstance::new(2, 1);
        let actions = host.call(|ctx| {
            unit.process_deactivate_message(
                from,
                &body,
                ReplicaDeactivationInfo::empty(),
                false,
                ctx,
            )
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            StateMachineAction::SendToPeer {
                message: PeerMessage::DeactivateReply(reply),
                ..
            } if reply.replica.state == ReplicaState::Dropped
        )));
    }

    #[test]
    fn test_stale_configuration_body_is_dropped() {
        let unit = test_support::open_primary_with_secondaries(&[2]);
        let mut body = ConfigurationMessageBody {
            fu_desc: *unit.description(),
            service_desc: unit.service_description().clone(),
            replicas: unit.replicas().map(ReplicaDescription::from).collect(),
        };
        for desc in &mut body.replicas {
            if desc.replica_id == 2 {
                desc.instance_id -= 1;
            }
        }
        assert!(unit.is_configuration_message_body_stale(&body));
    }

    #[test]
    fn test_slow_reconfiguration_reports_health_warning() {
        let mut host = TestHost::new();
        let mut unit = test_support::open_primary_with_secondaries(&[2, 3]);

        // A membership-preserving reconfiguration parks in catchup until the
        // replicator answers.
        let mut body = swap_body(&unit, unit.local_replica_id());
        for desc in &mut body.replicas {
            desc.current_configuration_role = desc.previous_configuration_role;
        }
        host.call(|ctx| unit.process_do_reconfiguration(&body, ctx));
        assert_eq!(
            unit.reconfiguration_stage(),
            ReconfigurationStage::Phase2Catchup
        );

        let config = ReconfigurationConfig::default();
        host.now += chrono::Duration::from_std(config.reconfiguration_health_report_threshold)
            .unwrap()
            + chrono::Duration::seconds(1);

        let actions = host.call(|ctx| unit.check_reconfiguration_progress(ctx));
        assert!(actions.iter().any(|a| matches!(
            a,
            StateMachineAction::ReportHealth {
                event: ReplicaHealthEvent::Warning,
                ..
            }
        )));
    }
}
