use super::{FailoverUnit, FailoverUnitLifeState};
use crate::actions::{
    FmMessage, PeerMessage, ProxyMessage, ReplicaHealthEvent, StateMachineAction,
};
use crate::context::ExecutionContext;
use crate::epoch::ReplicaDeactivationInfo;
use crate::error::ErrorCode;
use crate::fm_message_state::FmMessageStage;
use crate::messages::{
    FailoverUnitInfo, ProxyReplyMessageBody, ProxyUpdateServiceDescriptionReplyMessageBody,
    ReplicaDescription, ReplicaMessageBody, ReplicaReplyMessageBody, ServiceDescription,
};
use crate::node::NodeInstance;
use crate::replica::{Replica, ReplicaMessageStage, ReplicaRole, ReplicaState};
use crate::retryable_error::{RetryableErrorAction, RetryableErrorStateName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How the local replica is being opened on the replicator proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplicaOpenMode {
    #[default]
    None,
    /// Fresh replica.
    Open,
    /// Existing open replica changing role.
    ChangeRole,
    /// Persisted replica coming back after a restart.
    Reopen,
}

/// Why the local replica is being closed. The mode decides what state the
/// unit ends in and what is reported to the failover manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplicaCloseMode {
    #[default]
    None,
    /// Graceful close; persisted replicas come back as StandBy.
    Close,
    Drop,
    DeactivateNode,
    Abort,
    Restart,
    Delete,
    Deactivate,
    ForceAbort,
    ForceDelete,
    /// Delete queued behind an in-flight close.
    QueuedDelete,
    AppHostDown,
    Obliterate,
}

impl ReplicaCloseMode {
    /// The unit ends up with a dropped local replica.
    pub fn is_drop_implied(self) -> bool {
        matches!(
            self,
            ReplicaCloseMode::Drop
                | ReplicaCloseMode::Abort
                | ReplicaCloseMode::ForceAbort
                | ReplicaCloseMode::Obliterate
                | ReplicaCloseMode::Deactivate
                | ReplicaCloseMode::Delete
                | ReplicaCloseMode::ForceDelete
                | ReplicaCloseMode::QueuedDelete
        )
    }

    /// The service is being deleted; no further reports go to the manager.
    pub fn is_delete_implied(self) -> bool {
        matches!(
            self,
            ReplicaCloseMode::Delete | ReplicaCloseMode::ForceDelete | ReplicaCloseMode::QueuedDelete
        )
    }

    /// Forced modes pre-empt an in-flight close with a different mode.
    pub fn is_forced(self) -> bool {
        matches!(
            self,
            ReplicaCloseMode::ForceAbort | ReplicaCloseMode::ForceDelete | ReplicaCloseMode::Obliterate
        )
    }

    /// Modes for which a revoked read/write status must be reported to the
    /// failover manager as replica down.
    pub fn reports_replica_down_on_revoke(self) -> bool {
        matches!(
            self,
            ReplicaCloseMode::Close
                | ReplicaCloseMode::Drop
                | ReplicaCloseMode::DeactivateNode
                | ReplicaCloseMode::Abort
                | ReplicaCloseMode::Restart
                | ReplicaCloseMode::Deactivate
        )
    }
}

impl FailoverUnit {
    // ----- create / open -----

    /// Create-replica request from the failover manager (new primary or
    /// idle) or from a peer primary (idle build target).
    pub fn process_create_local_replica(
        &mut self,
        body: &ReplicaMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_open() {
            // Retry of the create; answer with the current state by
            // resending the open if it is still pending.
            if body.replica.instance_id < self.local_replica_instance_id {
                debug!(unit = %self.fu_desc, "stale create replica dropped");
                return;
            }
            if self.local_replica_open_pending {
                self.send_replica_open_message(context);
            }
            return;
        }

        if self.local_replica_deleted {
            debug!(unit = %self.fu_desc, "create replica on deleted unit dropped");
            return;
        }

        context.update.enable_update();

        let role = body.replica.current_configuration_role;
        self.set_failover_unit_description(body.fu_desc);
        self.set_service_description(body.service_desc.clone());
        self.local_replica_id = body.replica.replica_id;
        self.local_replica_instance_id = body.replica.instance_id;
        self.state = FailoverUnitLifeState::Open;
        self.replica_store = crate::replica_store::ReplicaStore::new(self.local_replica_id);

        let mut local = Replica::new(
            body.replica.replica_id,
            body.replica.instance_id,
            context.node_instance,
        );
        local.current_configuration_role = role;
        local.state = ReplicaState::InCreate;
        self.replica_store.add(local);

        // Deactivation info starts out per role: a fresh primary certifies
        // everything from zero; a new idle trusts what the primary sent;
        // anything else keeps the strict empty default.
        self.deactivation_info = match role {
            ReplicaRole::Primary => {
                ReplicaDeactivationInfo::new(body.fu_desc.current_configuration_epoch, 0)
            }
            ReplicaRole::Idle => body
                .replica
                .deactivation_info
                .unwrap_or_else(ReplicaDeactivationInfo::empty),
            _ => ReplicaDeactivationInfo::empty(),
        };

        self.open_mode = ReplicaOpenMode::Open;
        self.local_replica_open_pending = true;
        self.retryable_error_state
            .enter_state(RetryableErrorStateName::ReplicaOpen);
        self.touch(context.now);

        info!(unit = %self.fu_desc, role = %role, "local replica created");
        self.send_replica_open_message(context);
        self.assert_invariants();
    }

    pub(crate) fn send_replica_open_message(&mut self, context: &mut ExecutionContext<'_>) {
        let service_type = self.service_desc.service_type.clone();
        if self
            .service_type_registration
            .try_get_and_add(context.hosting, &service_type)
            .is_err()
        {
            // No runtime yet; the retry timer drives another attempt.
            self.message_retry_active = true;
            return;
        }

        let body = self.local_replica_message_body();
        context
            .queue
            .enqueue(StateMachineAction::SendToProxy(ProxyMessage::ReplicaOpen(
                body,
            )));
    }

    /// Reply from the proxy for a replica-open command.
    pub fn process_replica_open_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.local_replica_open_pending
            || body.local_replica.replica_id != self.local_replica_id
            || body.local_replica.instance_id != self.local_replica_instance_id
        {
            debug!(unit = %self.fu_desc, "stale replica open reply dropped");
            return;
        }

        if !body.error_code.is_success() {
            self.process_open_failure(body.error_code, context);
            return;
        }

        context.update.enable_update();

        let open_mode = self.open_mode;
        let cc_epoch = self.fu_desc.current_configuration_epoch;
        {
            let local = self.local_replica_mut();
            local.state = match open_mode {
                ReplicaOpenMode::Open | ReplicaOpenMode::ChangeRole => ReplicaState::Ready,
                ReplicaOpenMode::Reopen => ReplicaState::StandBy,
                ReplicaOpenMode::None => local.state,
            };
            local.is_up = true;
            local.service_location = body.local_replica.service_location.clone();
            local.replication_endpoint = body.local_replica.replication_endpoint.clone();
        }

        // A primary that just opened certifies its own catchup point.
        if self.local_replica().current_configuration_role == ReplicaRole::Primary {
            let catchup_lsn = body.local_replica.last_acknowledged_lsn.max(0);
            self.deactivation_info = ReplicaDeactivationInfo::new(cc_epoch, catchup_lsn);
        }

        self.local_replica_open_pending = false;
        self.local_replica_open = true;
        self.open_mode = ReplicaOpenMode::None;

        if open_mode != ReplicaOpenMode::Reopen {
            self.fm_message_state.on_replica_up();
            self.enqueue_health_event(ReplicaHealthEvent::Open, "replica opened", context);
        } else {
            // Reopened standby: report up so the manager can place it.
            self.fm_message_state.on_replica_up();
        }

        if self.replica_upload_state.on_deferred_upload_ready() {
            self.fm_message_state.on_upload_pending();
        }

        let action = self
            .retryable_error_state
            .on_success_and_transition_to(RetryableErrorStateName::None);
        self.apply_retryable_error_action(action, ErrorCode::Success, context);

        self.touch(context.now);
        info!(unit = %self.fu_desc, mode = ?open_mode, "local replica opened");
        self.assert_invariants();
    }

    pub(crate) fn process_open_failure(
        &mut self,
        error: ErrorCode,
        context: &mut ExecutionContext<'_>,
    ) {
        let action = self.retryable_error_state.on_failure(context.config);
        self.apply_retryable_error_action(action, error, context);
        if action == RetryableErrorAction::None
            || action == RetryableErrorAction::ReportHealthWarning
        {
            self.message_retry_active = true;
        }
    }

    /// Maps a retryable-error escalation onto unit state: restarts/drops the
    /// local replica or emits the corresponding health event.
    pub(crate) fn apply_retryable_error_action(
        &mut self,
        action: RetryableErrorAction,
        error: ErrorCode,
        context: &mut ExecutionContext<'_>,
    ) {
        match action {
            RetryableErrorAction::None => {}
            RetryableErrorAction::Restart | RetryableErrorAction::Drop => {
                let mode = if self.has_persisted_state() && action == RetryableErrorAction::Restart
                {
                    ReplicaCloseMode::Restart
                } else {
                    ReplicaCloseMode::Drop
                };
                self.start_close_local_replica(mode, None, context);
            }
            RetryableErrorAction::ReportHealthWarning => {
                self.enqueue_health_event(
                    ReplicaHealthEvent::Warning,
                    format!("transition retries failing: {}", error),
                    context,
                );
            }
            RetryableErrorAction::ReportHealthError => {
                self.enqueue_health_event(
                    ReplicaHealthEvent::Error,
                    format!("transition retries exhausted: {}", error),
                    context,
                );
            }
            RetryableErrorAction::ClearHealthReport => {
                self.enqueue_health_event(ReplicaHealthEvent::ClearWarning, "recovered", context);
            }
        }
    }

    // ----- reopen / node up -----

    /// Node-up acknowledgement from the failover manager: every unit must
    /// upload itself, and down persisted replicas reopen.
    pub fn process_node_up_ack(
        &mut self,
        is_deferred_upload_required: bool,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() {
            if !self.local_replica_deleted {
                self.replica_upload_state.on_upload_pending();
                self.fm_message_state.on_dropped();
            }
            return;
        }

        if is_deferred_upload_required {
            self.replica_upload_state.on_deferred_upload_required();
        } else {
            self.replica_upload_state.on_upload_pending();
            self.fm_message_state.on_upload_pending();
        }

        if !self.local_replica().is_up && self.has_persisted_state() {
            self.reopen_down_replica(context);
        }
    }

    /// Brings a down persisted replica back as StandBy under a new instance
    /// id.
    pub fn reopen_down_replica(&mut self, context: &mut ExecutionContext<'_>) {
        if self.is_closed() || self.local_replica().is_up {
            return;
        }

        context.update.enable_update();

        self.local_replica_instance_id += 1;
        let new_instance = self.local_replica_instance_id;
        let node = context.node_instance;
        {
            let local = self.local_replica_mut();
            local.instance_id = new_instance;
            local.node = node;
            local.is_up = true;
            local.state = ReplicaState::StandBy;
        }

        self.open_mode = ReplicaOpenMode::Reopen;
        self.local_replica_open_pending = true;
        self.local_replica_open = false;
        self.retryable_error_state
            .enter_state(RetryableErrorStateName::ReplicaReopen);
        self.touch(context.now);

        info!(unit = %self.fu_desc, instance = new_instance, "reopening down replica");
        self.send_replica_open_message(context);
        self.assert_invariants();
    }

    // ----- close -----

    /// Whether a close with the given mode may start now.
    pub fn can_close_local_replica(&self, mode: ReplicaCloseMode) -> bool {
        if self.is_closed() {
            // Only deletes make sense on a closed unit (mark + cleanup).
            return mode.is_delete_implied();
        }

        if self.local_replica_close_pending {
            return mode.is_forced() || mode == self.close_mode;
        }

        if !self.local_replica().is_up {
            // Down replicas transition state directly; every mode is
            // acceptable.
            return true;
        }

        true
    }

    /// Whether the close requested by `mode` has already taken effect.
    pub fn is_local_replica_closed(&self, mode: ReplicaCloseMode) -> bool {
        match mode {
            ReplicaCloseMode::Restart | ReplicaCloseMode::Close | ReplicaCloseMode::AppHostDown => {
                self.is_open() && !self.local_replica().is_up
            }
            _ if mode.is_delete_implied() => self.is_closed() && self.local_replica_deleted,
            _ => self.is_closed(),
        }
    }

    /// Begins closing the local replica. For an up replica this sends the
    /// close to the proxy and waits; for a down or volatile replica the
    /// state transition is immediate.
    pub fn start_close_local_replica(
        &mut self,
        mode: ReplicaCloseMode,
        sender: Option<NodeInstance>,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.can_close_local_replica(mode) || self.is_local_replica_closed(mode) {
            if self.is_closed() && mode.is_delete_implied() {
                self.mark_local_replica_deleted(context);
            }
            return;
        }

        context.update.enable_update();

        if mode.is_delete_implied() {
            self.local_replica_deleted = true;
        }

        self.close_mode = mode;
        self.sender_node = sender;

        self.enqueue_replica_state_change_trace(
            self.local_replica_id,
            format!("close {:?}", mode),
            context,
        );

        if !self.local_replica().is_up {
            // Nothing to ask the proxy; complete synchronously.
            self.local_replica_close_pending = true;
            self.finish_close_local_replica(context);
            self.assert_invariants();
            return;
        }

        self.local_replica_close_pending = true;
        self.retryable_error_state.enter_state(if mode.is_delete_implied() {
            RetryableErrorStateName::ReplicaDelete
        } else {
            RetryableErrorStateName::ReplicaClose
        });

        self.send_replica_close_message(context);
        self.touch(context.now);
        self.assert_invariants();
    }

    pub(crate) fn send_replica_close_message(&mut self, context: &mut ExecutionContext<'_>) {
        let body = self.local_replica_message_body();
        let is_drop_implied = self.close_mode.is_drop_implied();
        context
            .queue
            .enqueue(StateMachineAction::SendToProxy(ProxyMessage::ReplicaClose {
                body,
                is_drop_implied,
            }));
    }

    /// Reply from the proxy for a replica-close command.
    pub fn process_replica_close_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.local_replica_close_pending
            || body.local_replica.replica_id != self.local_replica_id
            || body.local_replica.instance_id != self.local_replica_instance_id
        {
            debug!(unit = %self.fu_desc, "stale replica close reply dropped");
            return;
        }

        if !body.error_code.is_success() {
            let action = self.retryable_error_state.on_failure(context.config);
            self.apply_retryable_error_action(action, body.error_code, context);
            self.message_retry_active = true;
            return;
        }

        let action = self
            .retryable_error_state
            .on_success_and_transition_to(RetryableErrorStateName::None);
        self.apply_retryable_error_action(action, ErrorCode::Success, context);

        self.finish_close_local_replica(context);
        self.assert_invariants();
    }

    /// Applies the close: transitions to down or dropped per mode, notifies
    /// the failover-manager tracker, and reports health.
    pub(crate) fn finish_close_local_replica(&mut self, context: &mut ExecutionContext<'_>) {
        debug_assert!(
            self.local_replica_close_pending,
            "close pending must be set {}",
            self.fu_desc
        );

        context.update.enable_update();

        let mode = self.close_mode;
        let mut report_closed_health_event = self.local_replica_open && self.local_replica().is_up;
        let instance_id = self.local_replica_instance_id;
        let has_persisted = self.has_persisted_state();

        if !has_persisted || (mode.is_drop_implied() && mode != ReplicaCloseMode::QueuedDelete) {
            self.update_state_on_local_replica_dropped(context);
        } else {
            self.update_state_on_local_replica_down(context);
        }

        match mode {
            ReplicaCloseMode::Close
            | ReplicaCloseMode::DeactivateNode
            | ReplicaCloseMode::AppHostDown => {
                self.fm_message_state.on_replica_down(has_persisted, instance_id);
            }
            ReplicaCloseMode::Restart => {
                // The new instance reports its own health; skip the close
                // event.
                report_closed_health_event = false;
                self.fm_message_state.on_replica_down(has_persisted, instance_id);
            }
            ReplicaCloseMode::Drop
            | ReplicaCloseMode::Abort
            | ReplicaCloseMode::ForceAbort
            | ReplicaCloseMode::Obliterate
            | ReplicaCloseMode::Deactivate => {
                self.fm_message_state.on_dropped();
            }
            ReplicaCloseMode::Delete
            | ReplicaCloseMode::ForceDelete
            | ReplicaCloseMode::QueuedDelete => {}
            ReplicaCloseMode::None => {}
        }

        if report_closed_health_event {
            self.enqueue_health_event(ReplicaHealthEvent::Close, "replica closed", context);
        }

        if mode == ReplicaCloseMode::Restart {
            // Immediately reopen under a new instance.
            self.reopen_down_replica(context);
        }

        info!(unit = %self.fu_desc, mode = ?mode, "local replica closed");
    }

    // ----- down / dropped bookkeeping -----

    pub(crate) fn update_state_on_local_replica_down(
        &mut self,
        context: &mut ExecutionContext<'_>,
    ) {
        debug_assert!(
            self.has_persisted_state(),
            "volatile replicas go straight to dropped"
        );

        self.reset_local_state();
        self.service_type_registration.on_replica_down(context.hosting);

        let local_id = self.replica_store.local_replica_id();
        for replica in self.replica_store.iter_mut() {
            replica.update_state_on_local_replica_down(replica.replica_id == local_id);
        }
        self.replica_store.clear_idle_replicas();
        self.touch(context.now);
    }

    pub(crate) fn update_state_on_local_replica_dropped(
        &mut self,
        context: &mut ExecutionContext<'_>,
    ) {
        self.reset_local_state();

        self.state = FailoverUnitLifeState::Closed;
        self.replica_store.clear();
        self.deactivation_info = ReplicaDeactivationInfo::dropped();

        if self.local_replica_deleted {
            self.cleanup_pending = true;
        }

        self.service_type_registration.on_replica_closed(context.hosting);
        self.touch(context.now);
    }

    pub(crate) fn reset_local_state(&mut self) {
        self.reset_flags();
        self.reset_non_flag_state();
    }

    pub(crate) fn reset_flags(&mut self) {
        self.local_replica_close_pending = false;
        self.local_replica_open_pending = false;
        self.service_description_update_pending = false;
        self.message_retry_active = false;
    }

    pub(crate) fn reset_non_flag_state(&mut self) {
        self.sender_node = None;
        self.data_loss_version_to_report = 0;
        self.reconfig_state.reset();
        self.change_config_fu_desc = None;
        self.change_config_replicas.clear();
        self.update_replicator_configuration = false;
        self.local_replica_open = false;
        self.retryable_error_state.reset();
        self.close_mode = ReplicaCloseMode::None;
        self.endpoint_publish_state.clear();
    }

    // ----- delete / revoke -----

    pub fn mark_local_replica_deleted(&mut self, context: &mut ExecutionContext<'_>) {
        if self.local_replica_deleted {
            return;
        }

        context.update.enable_update();
        self.local_replica_deleted = true;

        // Deleted means the manager asked; it needs no further reports and
        // the upload requirement is moot.
        self.fm_message_state.reset();
        self.replica_upload_state.on_uploaded();

        if self.is_closed() {
            self.cleanup_pending = true;
        }
    }

    /// The proxy revoked read/write status (quorum loss or close in
    /// progress). Always replied to; the down report depends on the close
    /// mode.
    pub fn process_read_write_status_revoked_notification(
        &mut self,
        body: &ReplicaMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::ReadWriteStatusRevokedNotificationReply(ReplicaReplyMessageBody {
                fu_desc: body.fu_desc,
                replica: body.replica.clone(),
                error_code: ErrorCode::Success,
            }),
        ));

        if !self.local_replica_close_pending {
            return;
        }
        if !self.close_mode.reports_replica_down_on_revoke() {
            return;
        }

        let has_persisted = self.has_persisted_state();
        let instance = self.local_replica_instance_id;
        self.fm_message_state.on_replica_down(has_persisted, instance);
    }

    // ----- service description update -----

    pub fn validate_update_service_description(&self, incoming: &ServiceDescription) -> bool {
        self.service_desc.name == incoming.name
            && self.service_desc.instance == incoming.instance
            && self.service_desc.update_version < incoming.update_version
    }

    pub fn update_service_description(
        &mut self,
        incoming: &ServiceDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.validate_update_service_description(incoming) {
            debug!(unit = %self.fu_desc, "stale service description update dropped");
            return;
        }

        context.update.enable_update();
        self.set_service_description(incoming.clone());

        // Closed, closing or down replicas pick the new description up on
        // their next open; only a live runtime needs an explicit push.
        if self.is_closed()
            || self.local_replica_close_pending
            || !self.local_replica().is_up
            || (self.local_replica_open_pending && !self.service_type_registration.is_runtime_active())
        {
            return;
        }

        self.service_description_update_pending = true;
        let body = self.local_replica_message_body();
        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::UpdateServiceDescription(body),
        ));
    }

    pub fn process_update_service_description_reply(
        &mut self,
        body: &ProxyUpdateServiceDescriptionReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if !self.service_description_update_pending
            || !body.error_code.is_success()
            || body.local_replica.replica_id != self.local_replica_id
            || body.local_replica.instance_id != self.local_replica_instance_id
            || body.service_desc.update_version < self.service_desc.update_version
        {
            debug!(unit = %self.fu_desc, "stale service description reply dropped");
            return;
        }

        context.update.enable_update();
        self.service_description_update_pending = false;
    }

    // ----- failover manager reporting -----

    pub fn on_replica_uploaded(&mut self, context: &mut ExecutionContext<'_>) {
        if self.replica_upload_state.is_upload_pending() {
            context.update.enable_update();
        }
        self.replica_upload_state.on_uploaded();
    }

    /// Builds the whole-unit report for the failover manager.
    pub fn try_get_configuration(
        &self,
        node_instance: NodeInstance,
        report_down: bool,
    ) -> Option<FailoverUnitInfo> {
        let local_replica = if self.is_closed() {
            let mut desc = ReplicaDescription::new(
                node_instance,
                self.local_replica_id,
                self.local_replica_instance_id,
            );
            desc.state = ReplicaState::Dropped;
            desc.is_up = false;
            desc
        } else {
            let mut desc = ReplicaDescription::from(self.local_replica());
            if report_down {
                desc.is_up = false;
            }
            desc
        };

        let replicas: Vec<ReplicaDescription> = if self.is_closed() {
            vec![local_replica.clone()]
        } else {
            self.replica_store.iter().map(ReplicaDescription::from).collect()
        };

        Some(FailoverUnitInfo {
            fu_desc: self.fu_desc,
            service_desc: self.service_desc.clone(),
            local_replica,
            replicas,
            sequence_number: self.fm_message_state.sequence_number(),
        })
    }

    /// Composes the pending failover-manager message if one is due.
    pub fn try_compose_fm_message(
        &self,
        node_instance: NodeInstance,
        now: chrono::DateTime<chrono::Utc>,
        min_interval: std::time::Duration,
    ) -> Option<(FmMessage, i64)> {
        let sequence_number = self.fm_message_state.should_retry(now, min_interval)?;

        match self.fm_message_state.message_stage() {
            FmMessageStage::None => None,
            FmMessageStage::ReplicaUp
            | FmMessageStage::ReplicaUpload
            | FmMessageStage::ReplicaDropped
            | FmMessageStage::ReplicaDown => {
                let report_down =
                    self.fm_message_state.message_stage() == FmMessageStage::ReplicaDown;
                let info = self.try_get_configuration(node_instance, report_down)?;
                let in_dropped_list = info.local_replica.is_dropped();
                Some((
                    FmMessage::ReplicaUp {
                        info,
                        in_dropped_list,
                    },
                    sequence_number,
                ))
            }
            FmMessageStage::EndpointAvailable => {
                let body = ReplicaMessageBody {
                    fu_desc: self.fu_desc,
                    replica: ReplicaDescription::from(self.local_replica()),
                    service_desc: self.service_desc.clone(),
                };
                Some((FmMessage::EndpointUpdated(body), sequence_number))
            }
        }
    }

    pub fn on_fm_message_sent(&mut self, now: chrono::DateTime<chrono::Utc>, sequence_number: i64) {
        self.fm_message_state.on_retry(now, sequence_number);
    }

    /// Reply to the unit's pending replica-up/down/dropped report.
    pub fn process_replica_up_reply(
        &mut self,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        self.on_replica_uploaded(context);

        match self.fm_message_state.message_stage() {
            FmMessageStage::ReplicaDropped => {
                // A reply about a non-dropped incarnation is a delayed ack
                // for an older report.
                if desc.state != ReplicaState::Dropped {
                    return;
                }
                context.update.enable_update();
                self.fm_message_state.on_replica_dropped_reply();
            }
            FmMessageStage::ReplicaDown => {
                if self.is_closed() && desc.instance_id != self.local_replica_instance_id {
                    return;
                }
                if desc.is_up {
                    return;
                }
                context.update.enable_update();
                self.fm_message_state.on_replica_down_reply(desc.instance_id);
            }
            FmMessageStage::ReplicaUp | FmMessageStage::ReplicaUpload => {
                if desc.instance_id != self.local_replica_instance_id {
                    return;
                }
                context.update.enable_update();
                self.fm_message_state.on_replica_up_acknowledged();
            }
            _ => {}
        }
    }

    pub fn process_replica_dropped_reply(
        &mut self,
        error: ErrorCode,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        self.on_replica_uploaded(context);

        if !error.is_success() && !error.is_error(ErrorCode::FailoverUnitNotFound) {
            return;
        }
        if desc.instance_id != self.local_replica_instance_id {
            return;
        }

        context.update.enable_update();
        self.fm_message_state.on_replica_dropped_reply();
    }

    pub fn process_replica_endpoint_updated_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if !body
            .fu_desc
            .current_configuration_epoch
            .is_primary_epoch_equal(&self.fu_desc.current_configuration_epoch)
            || !body.error_code.is_success()
        {
            return;
        }

        context.update.enable_update();
        self.endpoint_publish_state.on_fm_reply();
        self.fm_message_state.on_endpoint_publish_reply();
    }

    // ----- idle replica management (primary side) -----

    /// Add-replica request from the failover manager: start building a new
    /// idle replica on `target`.
    pub fn process_add_replica(
        &mut self,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || self.local_replica().current_configuration_role != ReplicaRole::Primary
        {
            debug!(unit = %self.fu_desc, "add replica dropped: not primary");
            return;
        }

        if let Some(existing) = self.replica_store.get(desc.replica_id) {
            if existing.instance_id >= desc.instance_id {
                // Retry; push the protocol along instead of re-adding.
                self.process_replica_message_resend_by_id(desc.replica_id, context);
                return;
            }
            self.replica_store.remove(desc.replica_id);
        }

        context.update.enable_update();

        let mut replica = Replica::new(desc.replica_id, desc.instance_id, desc.node);
        replica.state = ReplicaState::InCreate;
        let target = replica.node;
        self.replica_store.add(replica);
        self.touch(context.now);

        let message = PeerMessage::CreateReplica(ReplicaMessageBody {
            fu_desc: self.fu_desc,
            replica: self.replica_description_with_deactivation_info(desc),
            service_desc: self.service_desc.clone(),
        });
        context
            .queue
            .enqueue(StateMachineAction::SendToPeer { target, message });
        self.assert_invariants();
    }

    fn replica_description_with_deactivation_info(
        &self,
        desc: &ReplicaDescription,
    ) -> ReplicaDescription {
        let mut out = desc.clone();
        out.current_configuration_role = ReplicaRole::Idle;
        out.deactivation_info = Some(self.deactivation_info);
        out
    }

    /// The target node created its replica; hand the build to the
    /// replicator.
    pub fn process_create_replica_reply(
        &mut self,
        body: &ReplicaReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !body.error_code.is_success() {
            return;
        }

        let fu_desc = self.fu_desc;
        let service_desc = self.service_desc.clone();

        let Some(replica) = self.replica_store.get_mut(body.replica.replica_id) else {
            return;
        };
        if replica.instance_id != body.replica.instance_id || !replica.is_in_create() {
            debug!("stale create replica reply dropped");
            return;
        }

        context.update.enable_update();
        replica.state = ReplicaState::InBuild;
        replica.message_stage = ReplicaMessageStage::RaProxyReplyPending;
        replica.replication_endpoint = body.replica.replication_endpoint.clone();
        let build_body = ReplicaMessageBody {
            fu_desc,
            replica: ReplicaDescription::from(&*replica),
            service_desc,
        };

        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::BuildIdleReplica(build_body),
        ));
        self.touch(context.now);
        self.assert_invariants();
    }

    /// Build finished on the replicator. What happens next depends on the
    /// reconfiguration stage the unit is in.
    pub fn process_build_idle_replica_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        use crate::reconfig_state::ReconfigurationStage::*;

        if self.is_closed() || !body.error_code.is_success() {
            return;
        }

        let stage = self.reconfig_state.stage();
        let Some(replica) = self.replica_store.get_mut(body.local_replica.replica_id) else {
            return;
        };
        if replica.instance_id != body.local_replica.instance_id || !replica.is_in_build() {
            debug!("stale build idle replica reply dropped");
            return;
        }

        context.update.enable_update();

        let mut send_activate = false;
        match stage {
            Phase0Demote | Phase2Catchup => {
                // Deactivation happens via resend during catchup.
                replica.to_be_deactivated = true;
                replica.message_stage = ReplicaMessageStage::None;
            }
            Phase3Deactivate => {
                replica.to_be_deactivated = true;
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
            Phase4Activate => {
                replica.to_be_activated = true;
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
            }
            None => {
                replica.to_be_activated = true;
                replica.message_stage = ReplicaMessageStage::RaReplyPending;
                send_activate = true;
            }
            Phase1GetLsn | AbortPhase0Demote => {
                replica.message_stage = ReplicaMessageStage::None;
            }
        }

        let replica_id = body.local_replica.replica_id;
        if send_activate {
            self.send_activate_message_to(replica_id, context);
        }
        self.message_retry_active = true;
        self.touch(context.now);
        self.assert_invariants();
    }

    /// Remove-replica request: take an idle replica out of the replicator's
    /// view and forget it.
    pub fn process_remove_idle_replica(
        &mut self,
        desc: &ReplicaDescription,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() {
            return;
        }

        let fu_desc = self.fu_desc;
        let service_desc = self.service_desc.clone();
        let Some(replica) = self.replica_store.get_mut(desc.replica_id) else {
            return;
        };
        if replica.is_in_configuration() {
            warn!(unit = %fu_desc, "remove idle replica targeting configuration replica dropped");
            return;
        }

        context.update.enable_update();
        replica.replicator_remove_pending = true;
        replica.is_up = false;
        replica.message_stage = ReplicaMessageStage::RaProxyReplyPending;
        let body = ReplicaMessageBody {
            fu_desc,
            replica: ReplicaDescription::from(&*replica),
            service_desc,
        };

        context.queue.enqueue(StateMachineAction::SendToProxy(
            ProxyMessage::RemoveIdleReplica(body),
        ));
        self.touch(context.now);
    }

    pub fn process_remove_idle_replica_reply(
        &mut self,
        body: &ProxyReplyMessageBody,
        context: &mut ExecutionContext<'_>,
    ) {
        if self.is_closed() || !body.error_code.is_success() {
            return;
        }
        let Some(replica) = self.replica_store.get(body.local_replica.replica_id) else {
            return;
        };
        if !replica.replicator_remove_pending {
            return;
        }

        context.update.enable_update();
        self.replica_store.remove(body.local_replica.replica_id);
        self.touch(context.now);
        self.assert_invariants();
    }

    // ----- helpers -----

    pub(crate) fn local_replica_message_body(&self) -> ReplicaMessageBody {
        ReplicaMessageBody {
            fu_desc: self.fu_desc,
            replica: ReplicaDescription::from(self.local_replica()),
            service_desc: self.service_desc.clone(),
        }
    }
}
