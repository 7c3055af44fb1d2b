use crate::epoch::ReplicaDeactivationInfo;
use crate::messages::{
    ConfigurationMessageBody, ConfigurationReplyMessageBody, FailoverUnitId, FailoverUnitInfo,
    ReplicaMessageBody, ReplicaReplyMessageBody,
};
use crate::node::NodeInstance;
use crate::reconfig_state::{PhaseDurations, ReconfigurationResult, ReconfigurationType};
use serde::{Deserialize, Serialize};

/// Messages addressed to the failover manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FmMessage {
    /// Redirect: a different replica must become primary.
    ChangeConfiguration(ConfigurationMessageBody),
    DataLossReport(ConfigurationMessageBody),
    DoReconfigurationReply(ConfigurationReplyMessageBody),
    /// The outgoing primary finished demoting; the manager continues the
    /// swap on the new primary.
    ContinueSwapPrimary {
        body: ConfigurationReplyMessageBody,
        phase0_duration: std::time::Duration,
    },
    ReplicaUp {
        info: FailoverUnitInfo,
        in_dropped_list: bool,
    },
    /// An idle replica finished building and activating outside any
    /// reconfiguration.
    AddReplicaReply(ReplicaReplyMessageBody),
    EndpointUpdated(ReplicaMessageBody),
}

/// Messages addressed to a peer reconfiguration agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    GetLsn(ReplicaMessageBody),
    Deactivate {
        body: ConfigurationMessageBody,
        deactivation_info: ReplicaDeactivationInfo,
        /// A forced deactivate restarts the target replica instead of
        /// updating its configuration view.
        is_force: bool,
    },
    Activate {
        body: ConfigurationMessageBody,
        deactivation_info: ReplicaDeactivationInfo,
    },
    CreateReplica(ReplicaMessageBody),
    GetLsnReply(ReplicaReplyMessageBody),
    DeactivateReply(ReplicaReplyMessageBody),
    ActivateReply(ReplicaReplyMessageBody),
}

/// Variants of the update-configuration command to the replicator proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateConfigurationReason {
    Default,
    Catchup,
    EndReconfiguration,
}

/// Commands addressed to the local replicator proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyMessage {
    ReplicaOpen(ReplicaMessageBody),
    ReplicaClose {
        body: ReplicaMessageBody,
        is_drop_implied: bool,
    },
    UpdateConfiguration {
        body: ConfigurationMessageBody,
        reason: UpdateConfigurationReason,
    },
    ReplicatorGetStatus(ReplicaMessageBody),
    ReplicatorUpdateEpochAndGetStatus(ReplicaMessageBody),
    CancelCatchupReplicaSet(ConfigurationMessageBody),
    BuildIdleReplica(ReplicaMessageBody),
    RemoveIdleReplica(ReplicaMessageBody),
    UpdateServiceDescription(ReplicaMessageBody),
    ReadWriteStatusRevokedNotificationReply(ReplicaReplyMessageBody),
}

/// Health events about the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaHealthEvent {
    Open,
    Close,
    Restart,
    Warning,
    Error,
    ClearWarning,
    ClearError,
}

/// Diagnostic records emitted by the engine; delivery/formatting is the
/// hosting agent's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceRecord {
    ReconfigurationComplete {
        id: FailoverUnitId,
        reconfig_type: ReconfigurationType,
        result: ReconfigurationResult,
        durations: PhaseDurations,
    },
    ReconfigurationSlow {
        id: FailoverUnitId,
        stage: String,
        detail: String,
    },
    ReplicaStateChange {
        id: FailoverUnitId,
        replica_id: i64,
        detail: String,
    },
}

/// One intended side effect, recorded for the hosting agent to execute
/// after the state-machine call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateMachineAction {
    SendToFm(FmMessage),
    SendToPeer {
        target: NodeInstance,
        message: PeerMessage,
    },
    SendToProxy(ProxyMessage),
    ReportHealth {
        event: ReplicaHealthEvent,
        description: String,
    },
    Trace(TraceRecord),
}

/// Append-only list of intended side effects produced by one state-machine
/// call. The engine never reads back what it enqueued.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<StateMachineAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, action: StateMachineAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[StateMachineAction] {
        &self.actions
    }

    pub fn drain(&mut self) -> Vec<StateMachineAction> {
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let mut queue = ActionQueue::new();
        queue.enqueue(StateMachineAction::ReportHealth {
            event: ReplicaHealthEvent::Open,
            description: "open".into(),
        });
        queue.enqueue(StateMachineAction::ReportHealth {
            event: ReplicaHealthEvent::Close,
            description: "close".into(),
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert!(matches!(
            drained[0],
            StateMachineAction::ReportHealth {
                event: ReplicaHealthEvent::Open,
                ..
            }
        ));
    }
}
