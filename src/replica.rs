use crate::epoch::{Lsn, ReplicaDeactivationInfo, INVALID_LSN, UNKNOWN_LSN};
use crate::node::NodeInstance;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a replica within one configuration view (PC, IC or CC).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaRole {
    #[default]
    None,
    Idle,
    Secondary,
    Primary,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaRole::None => "N",
            ReplicaRole::Idle => "I",
            ReplicaRole::Secondary => "S",
            ReplicaRole::Primary => "P",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of a replica.
///
/// `None -> InCreate -> {Ready | InBuild -> Ready}`, `Ready -> InDrop ->
/// Dropped`. `StandBy` marks a durable-but-closed replica across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaState {
    InCreate,
    InBuild,
    StandBy,
    #[default]
    Ready,
    InDrop,
    Dropped,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaState::InCreate => "IC",
            ReplicaState::InBuild => "IB",
            ReplicaState::StandBy => "SB",
            ReplicaState::Ready => "RD",
            ReplicaState::InDrop => "ID",
            ReplicaState::Dropped => "DD",
        };
        write!(f, "{}", s)
    }
}

/// Which reply the engine is still waiting on for a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaMessageStage {
    #[default]
    None,
    /// Waiting on a reply from the peer reconfiguration agent.
    RaReplyPending,
    /// Waiting on a reply from the local replicator proxy.
    RaProxyReplyPending,
}

/// One replica's record within a failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub replica_id: i64,
    pub instance_id: i64,
    pub node: NodeInstance,

    pub previous_configuration_role: ReplicaRole,
    pub intermediate_configuration_role: ReplicaRole,
    pub current_configuration_role: ReplicaRole,

    pub state: ReplicaState,
    pub is_up: bool,

    pub first_acknowledged_lsn: Lsn,
    pub last_acknowledged_lsn: Lsn,

    pub message_stage: ReplicaMessageStage,

    pub to_be_activated: bool,
    pub to_be_deactivated: bool,
    pub to_be_restarted: bool,
    pub replicator_remove_pending: bool,

    pub deactivation_info: ReplicaDeactivationInfo,

    /// Client-facing endpoint published to the failover manager.
    pub service_location: String,
    /// Replication endpoint handed to peers during build.
    pub replication_endpoint: String,
}

impl Replica {
    pub fn new(replica_id: i64, instance_id: i64, node: NodeInstance) -> Self {
        Self {
            replica_id,
            instance_id,
            node,
            previous_configuration_role: ReplicaRole::None,
            intermediate_configuration_role: ReplicaRole::None,
            current_configuration_role: ReplicaRole::None,
            state: ReplicaState::InCreate,
            is_up: true,
            first_acknowledged_lsn: INVALID_LSN,
            last_acknowledged_lsn: INVALID_LSN,
            message_stage: ReplicaMessageStage::None,
            to_be_activated: false,
            to_be_deactivated: false,
            to_be_restarted: false,
            replicator_remove_pending: false,
            deactivation_info: ReplicaDeactivationInfo::empty(),
            service_location: String::new(),
            replication_endpoint: String::new(),
        }
    }

    pub fn is_in_previous_configuration(&self) -> bool {
        self.previous_configuration_role >= ReplicaRole::Secondary
    }

    pub fn is_in_current_configuration(&self) -> bool {
        self.current_configuration_role >= ReplicaRole::Secondary
    }

    pub fn is_in_configuration(&self) -> bool {
        self.is_in_previous_configuration() || self.is_in_current_configuration()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    pub fn is_in_build(&self) -> bool {
        self.state == ReplicaState::InBuild
    }

    pub fn is_in_create(&self) -> bool {
        self.state == ReplicaState::InCreate
    }

    pub fn is_standby(&self) -> bool {
        self.state == ReplicaState::StandBy
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    pub fn is_in_drop(&self) -> bool {
        self.state == ReplicaState::InDrop
    }

    /// Up and Ready: able to serve and to answer protocol messages.
    pub fn is_available(&self) -> bool {
        self.is_up && self.is_ready()
    }

    /// Down but not yet confirmed dropped.
    pub fn is_offline(&self) -> bool {
        !self.is_up && !self.is_dropped()
    }

    /// A build that has not completed yet; such a replica cannot answer
    /// deactivate/activate.
    pub fn is_build_in_progress(&self) -> bool {
        self.is_in_build() && !self.to_be_activated && !self.to_be_deactivated
    }

    /// The replica has reported progress (including an explicit "unknown").
    pub fn is_lsn_set(&self) -> bool {
        self.last_acknowledged_lsn != INVALID_LSN
    }

    pub fn is_lsn_unknown(&self) -> bool {
        self.last_acknowledged_lsn == UNKNOWN_LSN
    }

    /// A usable progress value: set and not the unknown sentinel.
    pub fn is_lsn_known(&self) -> bool {
        self.is_lsn_set() && !self.is_lsn_unknown()
    }

    pub fn set_progress(&mut self, first: Lsn, last: Lsn, info: ReplicaDeactivationInfo) {
        self.first_acknowledged_lsn = first;
        self.last_acknowledged_lsn = last;
        self.deactivation_info = info;
        self.message_stage = ReplicaMessageStage::None;
    }

    pub fn set_lsn_to_unknown(&mut self) {
        self.first_acknowledged_lsn = UNKNOWN_LSN;
        self.last_acknowledged_lsn = UNKNOWN_LSN;
        self.message_stage = ReplicaMessageStage::None;
    }

    /// The unknown sentinel only matters during the progress poll; clear it
    /// once the election is decided.
    pub fn try_clear_unknown_lsn(&mut self) {
        if self.is_lsn_unknown() {
            self.clear_lsn();
        }
    }

    pub fn clear_lsn(&mut self) {
        self.first_acknowledged_lsn = INVALID_LSN;
        self.last_acknowledged_lsn = INVALID_LSN;
    }

    pub fn clear_flags(&mut self) {
        self.to_be_activated = false;
        self.to_be_deactivated = false;
        self.to_be_restarted = false;
        self.replicator_remove_pending = false;
    }

    pub fn mark_as_dropped(&mut self) {
        self.state = ReplicaState::Dropped;
        self.is_up = false;
        self.message_stage = ReplicaMessageStage::None;
        self.clear_flags();
        self.clear_lsn();
    }

    /// Bookkeeping applied to every replica record when the local replica
    /// goes down. The local record survives as StandBy (persisted state);
    /// remote records lose transient protocol state since any in-flight
    /// exchange is void.
    pub fn update_state_on_local_replica_down(&mut self, is_local: bool) {
        self.message_stage = ReplicaMessageStage::None;
        self.clear_flags();
        self.clear_lsn();

        if is_local {
            self.is_up = false;
            if !self.is_dropped() {
                self.state = ReplicaState::StandBy;
            }
            self.previous_configuration_role = ReplicaRole::None;
            self.intermediate_configuration_role = ReplicaRole::None;
        }
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {} {} {} {}:{} {} {}/{}",
            self.previous_configuration_role,
            self.intermediate_configuration_role,
            self.current_configuration_role,
            self.state,
            if self.is_up { "U" } else { "D" },
            self.node,
            self.replica_id,
            self.instance_id,
            self.deactivation_info,
            self.first_acknowledged_lsn,
            self.last_acknowledged_lsn,
        )
    }
}
