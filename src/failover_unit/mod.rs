mod election;
mod invariants;
mod lifecycle;
mod progress;
mod reconfiguration;
mod resend;

pub use lifecycle::{ReplicaCloseMode, ReplicaOpenMode};
pub use progress::ReplicaSetCounts;

use crate::actions::{ReplicaHealthEvent, StateMachineAction, TraceRecord};
use crate::context::ExecutionContext;
use crate::epoch::{Epoch, ReplicaDeactivationInfo};
use crate::error::ReconfigResult;
use crate::fm_message_state::FmMessageState;
use crate::endpoint_publish::EndpointPublishState;
use crate::messages::{
    FailoverUnitDescription, FailoverUnitId, ReplicaDescription, ServiceDescription,
};
use crate::node::NodeInstance;
use crate::reconfig_state::{PhaseDurations, ReconfigurationStage, ReconfigurationState};
use crate::replica::{Replica, ReplicaMessageStage, ReplicaRole};
use crate::replica_store::ReplicaStore;
use crate::replica_upload::ReplicaUploadState;
use crate::retryable_error::RetryableErrorState;
use crate::service_type::ServiceTypeRegistrationWrapper;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Whether the unit currently hosts an open local replica record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailoverUnitLifeState {
    #[default]
    Closed,
    Open,
}

/// The per-partition aggregate root: owns the replica set, the
/// reconfiguration sub-state-machine and the auxiliary trackers, and exposes
/// the full protocol surface. Not internally thread-safe; the hosting agent
/// serializes calls per unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub(crate) fu_desc: FailoverUnitDescription,
    pub(crate) service_desc: ServiceDescription,

    pub(crate) local_replica_id: i64,
    pub(crate) local_replica_instance_id: i64,

    pub(crate) state: FailoverUnitLifeState,
    pub(crate) replica_store: ReplicaStore,
    pub(crate) reconfig_state: ReconfigurationState,
    pub(crate) deactivation_info: ReplicaDeactivationInfo,

    /// Node that requested the in-flight reconfiguration; the reply goes
    /// back to it.
    pub(crate) sender_node: Option<NodeInstance>,

    /// Data-loss version a report has already been sent for; gates repeat
    /// reports to one per increasing version.
    pub(crate) data_loss_version_to_report: i64,

    /// Snapshot of the change-configuration request taken at election time,
    /// so resends carry the exact LSNs that were compared.
    pub(crate) change_config_fu_desc: Option<FailoverUnitDescription>,
    pub(crate) change_config_replicas: Vec<ReplicaDescription>,

    pub(crate) update_replicator_configuration: bool,

    pub(crate) message_retry_active: bool,
    pub(crate) local_replica_open_pending: bool,
    pub(crate) local_replica_close_pending: bool,
    pub(crate) service_description_update_pending: bool,
    pub(crate) cleanup_pending: bool,

    pub(crate) local_replica_open: bool,
    pub(crate) local_replica_deleted: bool,
    pub(crate) open_mode: ReplicaOpenMode,
    pub(crate) close_mode: ReplicaCloseMode,

    /// Pre-deactivation-info releases used the last stable epoch to detect
    /// false progress; kept up to date so a rollback keeps working.
    pub(crate) last_stable_epoch: Epoch,

    pub(crate) last_updated: DateTime<Utc>,

    pub(crate) fm_message_state: FmMessageState,
    pub(crate) replica_upload_state: ReplicaUploadState,
    pub(crate) endpoint_publish_state: EndpointPublishState,
    pub(crate) retryable_error_state: RetryableErrorState,
    pub(crate) service_type_registration: ServiceTypeRegistrationWrapper,
}

impl FailoverUnit {
    /// A closed unit for a partition known to this node.
    pub fn new(id: FailoverUnitId, service_desc: ServiceDescription) -> Self {
        Self {
            fu_desc: FailoverUnitDescription::new(id, Epoch::invalid()),
            service_desc,
            local_replica_id: 0,
            local_replica_instance_id: 0,
            state: FailoverUnitLifeState::Closed,
            replica_store: ReplicaStore::new(0),
            reconfig_state: ReconfigurationState::new(),
            deactivation_info: ReplicaDeactivationInfo::empty(),
            sender_node: None,
            data_loss_version_to_report: 0,
            change_config_fu_desc: None,
            change_config_replicas: Vec::new(),
            update_replicator_configuration: false,
            message_retry_active: false,
            local_replica_open_pending: false,
            local_replica_close_pending: false,
            service_description_update_pending: false,
            cleanup_pending: false,
            local_replica_open: false,
            local_replica_deleted: false,
            open_mode: ReplicaOpenMode::None,
            close_mode: ReplicaCloseMode::None,
            last_stable_epoch: Epoch::invalid(),
            last_updated: Utc::now(),
            fm_message_state: FmMessageState::new(),
            replica_upload_state: ReplicaUploadState::new(),
            endpoint_publish_state: EndpointPublishState::new(),
            retryable_error_state: RetryableErrorState::new(),
            service_type_registration: ServiceTypeRegistrationWrapper::new(),
        }
    }

    pub fn id(&self) -> FailoverUnitId {
        self.fu_desc.id
    }

    pub fn description(&self) -> &FailoverUnitDescription {
        &self.fu_desc
    }

    pub fn service_description(&self) -> &ServiceDescription {
        &self.service_desc
    }

    pub fn is_open(&self) -> bool {
        self.state == FailoverUnitLifeState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == FailoverUnitLifeState::Closed
    }

    pub fn has_persisted_state(&self) -> bool {
        self.service_desc.has_persisted_state
    }

    pub fn local_replica_id(&self) -> i64 {
        self.local_replica_id
    }

    pub fn local_replica_instance_id(&self) -> i64 {
        self.local_replica_instance_id
    }

    pub fn is_local_replica_deleted(&self) -> bool {
        self.local_replica_deleted
    }

    pub fn is_cleanup_pending(&self) -> bool {
        self.cleanup_pending
    }

    pub fn is_message_retry_active(&self) -> bool {
        self.message_retry_active
    }

    pub fn is_local_replica_open(&self) -> bool {
        self.local_replica_open
    }

    pub fn is_open_pending(&self) -> bool {
        self.local_replica_open_pending
    }

    pub fn is_close_pending(&self) -> bool {
        self.local_replica_close_pending
    }

    pub fn reconfiguration_stage(&self) -> ReconfigurationStage {
        self.reconfig_state.stage()
    }

    pub fn reconfiguration_state(&self) -> &ReconfigurationState {
        &self.reconfig_state
    }

    pub fn deactivation_info(&self) -> ReplicaDeactivationInfo {
        self.deactivation_info
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replica_store.iter()
    }

    pub fn current_configuration_epoch(&self) -> Epoch {
        self.fu_desc.current_configuration_epoch
    }

    pub fn previous_configuration_epoch(&self) -> Epoch {
        self.fu_desc.previous_configuration_epoch
    }

    pub fn intermediate_configuration_epoch(&self) -> Epoch {
        self.fu_desc.intermediate_configuration_epoch
    }

    /// The local replica record. Calling this on a closed unit is a coding
    /// error.
    pub fn local_replica(&self) -> &Replica {
        match self.replica_store.local_replica() {
            Some(r) => r,
            None => panic!("local replica accessed on closed unit {}", self.fu_desc),
        }
    }

    pub(crate) fn local_replica_mut(&mut self) -> &mut Replica {
        match self.replica_store.local_replica_mut() {
            Some(r) => r,
            None => panic!("local replica accessed on closed unit"),
        }
    }

    /// Data loss has been declared between PC and CC.
    pub(crate) fn is_data_loss_between_pc_and_cc(&self) -> bool {
        self.fu_desc.previous_configuration_epoch.data_loss_version
            != self.fu_desc.current_configuration_epoch.data_loss_version
    }

    pub(crate) fn is_swap_primary(&self) -> bool {
        self.reconfig_state.is_swap_primary()
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
    }

    pub(crate) fn set_failover_unit_description(&mut self, fu_desc: FailoverUnitDescription) {
        self.fu_desc = fu_desc;
        self.last_stable_epoch = self.fu_desc.previous_configuration_epoch;
    }

    pub(crate) fn set_service_description(&mut self, service_desc: ServiceDescription) {
        self.service_desc = service_desc;
    }

    /// Applies the epochs of an accepted reconfiguration request.
    pub(crate) fn update_reconfiguration_epochs(&mut self, incoming: &FailoverUnitDescription) {
        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = incoming.previous_configuration_epoch;
        desc.intermediate_configuration_epoch = Epoch::invalid();
        desc.current_configuration_epoch = incoming.current_configuration_epoch;
        self.set_failover_unit_description(desc);
    }

    /// Undo CC bookkeeping after a rejected election or an aborted swap:
    /// every replica's CC role reverts to its PC role, transient progress is
    /// cleared, and remote replicas that were only being promoted out of
    /// idle are removed from the configuration view.
    pub(crate) fn revert_configuration(&mut self) {
        let local_id = self.replica_store.local_replica_id();
        // Replicas that were being added by the abandoned reconfiguration
        // (in CC but not in PC) have no place in the reverted view and an
        // uncertain build state; drop them from the store.
        self.replica_store.retain(|r| {
            r.replica_id == local_id
                || r.is_in_previous_configuration()
                || !r.is_in_current_configuration()
        });
        // Roles revert to the previous configuration's; the CC epoch is the
        // highest accepted epoch and never regresses.
        for replica in self.replica_store.iter_mut() {
            replica.current_configuration_role = replica.previous_configuration_role;
            replica.previous_configuration_role = ReplicaRole::None;
            replica.intermediate_configuration_role = ReplicaRole::None;
            replica.clear_lsn();
            replica.message_stage = ReplicaMessageStage::None;
            if replica.replica_id != local_id {
                replica.clear_flags();
            }
        }

        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = Epoch::invalid();
        desc.intermediate_configuration_epoch = Epoch::invalid();
        self.set_failover_unit_description(desc);

        debug!(unit = %self.fu_desc, "configuration reverted");
    }

    /// After a reconfiguration finishes: CC becomes the only configuration.
    pub(crate) fn reset_reconfiguration_states(&mut self) {
        let mut desc = self.fu_desc;
        desc.previous_configuration_epoch = Epoch::invalid();
        desc.intermediate_configuration_epoch = Epoch::invalid();
        self.set_failover_unit_description(desc);

        let local_id = self.replica_store.local_replica_id();
        for replica in self.replica_store.iter_mut() {
            replica.previous_configuration_role = ReplicaRole::None;
            replica.intermediate_configuration_role = ReplicaRole::None;
            replica.message_stage = ReplicaMessageStage::None;
            replica.clear_lsn();
        }
        // Replicas that fell out of the current configuration are kept only
        // if they are usable idle replicas.
        self.replica_store.retain(|r| {
            r.replica_id == local_id
                || r.is_in_current_configuration()
                || (r.is_up && r.is_ready())
        });
    }

    pub(crate) fn enqueue_health_event(
        &self,
        event: ReplicaHealthEvent,
        description: impl Into<String>,
        context: &mut ExecutionContext<'_>,
    ) {
        context.queue.enqueue(StateMachineAction::ReportHealth {
            event,
            description: description.into(),
        });
    }

    /// Completion record for the reconfiguration that just finished; must
    /// run after the `finish_*` transition so the retained result is
    /// reported.
    pub(crate) fn enqueue_reconfiguration_complete_trace(
        &self,
        durations: PhaseDurations,
        context: &mut ExecutionContext<'_>,
    ) {
        context.queue.enqueue(StateMachineAction::Trace(
            TraceRecord::ReconfigurationComplete {
                id: self.id(),
                reconfig_type: self.reconfig_state.reconfig_type(),
                result: self.reconfig_state.result(),
                durations,
            },
        ));
    }

    pub(crate) fn enqueue_replica_state_change_trace(
        &self,
        replica_id: i64,
        detail: impl Into<String>,
        context: &mut ExecutionContext<'_>,
    ) {
        context
            .queue
            .enqueue(StateMachineAction::Trace(TraceRecord::ReplicaStateChange {
                id: self.id(),
                replica_id,
                detail: detail.into(),
            }));
    }

    /// Post-deserialization fixup after the unit is loaded from the local
    /// store: the node restarted, so every replica is down and any in-flight
    /// reconfiguration is void.
    pub fn update_state_on_lfum_load(
        &mut self,
        context: &mut ExecutionContext<'_>,
    ) -> ReconfigResult<()> {
        if self.is_closed() {
            return Ok(());
        }

        if !self.has_persisted_state() {
            // Volatile replicas do not survive the node; the loaded record
            // can only describe a dropped replica.
            self.update_state_on_local_replica_dropped(context);
            return Ok(());
        }

        let local_id = self.replica_store.local_replica_id();
        for replica in self.replica_store.iter_mut() {
            replica.update_state_on_local_replica_down(replica.replica_id == local_id);
        }
        self.replica_store.clear_idle_replicas();
        self.reset_local_state();

        let has_persisted = self.has_persisted_state();
        let instance = self.local_replica_instance_id;
        let is_open = self.is_open();
        self.fm_message_state
            .on_loaded_from_store(is_open, has_persisted, instance);

        context.update.enable_update();
        self.touch(context.now);
        self.assert_invariants();
        Ok(())
    }
}

impl fmt::Display for FailoverUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {:?} {} {} {}:{} {} [{:?} {:?} {}] {}",
            self.fu_desc,
            self.state,
            self.reconfig_state,
            self.deactivation_info,
            self.local_replica_id,
            self.local_replica_instance_id,
            self.service_desc.update_version,
            self.open_mode,
            self.close_mode,
            self.fm_message_state,
            self.last_updated,
        )?;
        for replica in self.replica_store.iter() {
            writeln!(f, "{}", replica)?;
        }
        Ok(())
    }
}
