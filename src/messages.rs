use crate::epoch::{Epoch, Lsn, ReplicaDeactivationInfo, INVALID_LSN};
use crate::error::ErrorCode;
use crate::node::NodeInstance;
use crate::replica::{Replica, ReplicaRole, ReplicaState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of one replicated partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailoverUnitId(pub Uuid);

impl FailoverUnitId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FailoverUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of the service a failover unit belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    /// Bumped when the service is deleted and recreated under the same name.
    pub instance: i64,
    /// Bumped on every in-place service update.
    pub update_version: u64,
    pub service_type: String,
    pub target_replica_set_size: usize,
    pub min_replica_set_size: usize,
    pub has_persisted_state: bool,
}

impl ServiceDescription {
    pub fn new(name: &str, service_type: &str, target: usize, min: usize, persisted: bool) -> Self {
        Self {
            name: name.to_string(),
            instance: 1,
            update_version: 0,
            service_type: service_type.to_string(),
            target_replica_set_size: target,
            min_replica_set_size: min,
            has_persisted_state: persisted,
        }
    }
}

/// Identity + the three configuration epochs of a failover unit, carried on
/// every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub id: FailoverUnitId,
    pub previous_configuration_epoch: Epoch,
    pub intermediate_configuration_epoch: Epoch,
    pub current_configuration_epoch: Epoch,
}

impl FailoverUnitDescription {
    pub fn new(id: FailoverUnitId, current: Epoch) -> Self {
        Self {
            id,
            previous_configuration_epoch: Epoch::invalid(),
            intermediate_configuration_epoch: Epoch::invalid(),
            current_configuration_epoch: current,
        }
    }
}

impl fmt::Display for FailoverUnitDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{}",
            self.id,
            self.previous_configuration_epoch,
            self.intermediate_configuration_epoch,
            self.current_configuration_epoch
        )
    }
}

/// Wire form of one replica's record.
///
/// `deactivation_info` is `None` for replicas reported by protocol versions
/// that predate it; the backward-compatibility synthesis rule applies on
/// receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeInstance,
    pub replica_id: i64,
    pub instance_id: i64,
    pub previous_configuration_role: ReplicaRole,
    pub current_configuration_role: ReplicaRole,
    pub state: ReplicaState,
    pub is_up: bool,
    pub first_acknowledged_lsn: Lsn,
    pub last_acknowledged_lsn: Lsn,
    pub deactivation_info: Option<ReplicaDeactivationInfo>,
    pub service_location: String,
    pub replication_endpoint: String,
}

impl ReplicaDescription {
    pub fn new(node: NodeInstance, replica_id: i64, instance_id: i64) -> Self {
        Self {
            node,
            replica_id,
            instance_id,
            previous_configuration_role: ReplicaRole::None,
            current_configuration_role: ReplicaRole::None,
            state: ReplicaState::Ready,
            is_up: true,
            first_acknowledged_lsn: INVALID_LSN,
            last_acknowledged_lsn: INVALID_LSN,
            deactivation_info: None,
            service_location: String::new(),
            replication_endpoint: String::new(),
        }
    }

    pub fn is_lsn_set(&self) -> bool {
        self.last_acknowledged_lsn != INVALID_LSN
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    /// Strip the progress values; used when reporting replicas whose LSNs
    /// must not be trusted by the receiver.
    pub fn invalidate_lsn(&mut self) {
        self.first_acknowledged_lsn = INVALID_LSN;
        self.last_acknowledged_lsn = INVALID_LSN;
    }
}

impl From<&Replica> for ReplicaDescription {
    fn from(r: &Replica) -> Self {
        Self {
            node: r.node,
            replica_id: r.replica_id,
            instance_id: r.instance_id,
            previous_configuration_role: r.previous_configuration_role,
            current_configuration_role: r.current_configuration_role,
            state: r.state,
            is_up: r.is_up,
            first_acknowledged_lsn: r.first_acknowledged_lsn,
            last_acknowledged_lsn: r.last_acknowledged_lsn,
            deactivation_info: Some(r.deactivation_info),
            service_location: r.service_location.clone(),
            replication_endpoint: r.replication_endpoint.clone(),
        }
    }
}

/// A message about one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub service_desc: ServiceDescription,
}

/// Reply to a message about one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub error_code: ErrorCode,
}

/// A message carrying the full replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub service_desc: ServiceDescription,
    pub replicas: Vec<ReplicaDescription>,
}

impl ConfigurationMessageBody {
    pub fn replica(&self, replica_id: i64) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }
}

/// Reply to a configuration-level request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationReplyMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub error_code: ErrorCode,
}

/// Reconfiguration request from the placement authority.
///
/// A `phase0_duration` is present only when this request continues a
/// primary swap: it carries the demote time already spent on the outgoing
/// primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoReconfigurationMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub service_desc: ServiceDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub phase0_duration: Option<Duration>,
}

impl DoReconfigurationMessageBody {
    pub fn replica(&self, replica_id: i64) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }
}

/// Reply from the local replicator proxy about the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReplyMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub local_replica: ReplicaDescription,
    pub error_code: ErrorCode,
}

/// Reply to an update-service-description command sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUpdateServiceDescriptionReplyMessageBody {
    pub fu_desc: FailoverUnitDescription,
    pub local_replica: ReplicaDescription,
    pub service_desc: ServiceDescription,
    pub error_code: ErrorCode,
}

/// Whole-unit report uploaded to the failover manager (replica up/down/
/// dropped and the initial upload all share this shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitInfo {
    pub fu_desc: FailoverUnitDescription,
    pub service_desc: ServiceDescription,
    pub local_replica: ReplicaDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub sequence_number: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_description_from_replica() {
        let mut replica = Replica::new(3, 4, NodeInstance::new(1, 1));
        replica.current_configuration_role = ReplicaRole::Secondary;
        replica.set_progress(0, 17, ReplicaDeactivationInfo::new(Epoch::new(2, 0), 10));

        let desc = ReplicaDescription::from(&replica);
        assert_eq!(desc.replica_id, 3);
        assert_eq!(desc.last_acknowledged_lsn, 17);
        assert!(desc.deactivation_info.is_some());
        assert!(desc.is_lsn_set());
    }

    #[test]
    fn test_invalidate_lsn() {
        let mut desc = ReplicaDescription::new(NodeInstance::new(1, 1), 1, 1);
        desc.first_acknowledged_lsn = 5;
        desc.last_acknowledged_lsn = 9;
        desc.invalidate_lsn();
        assert!(!desc.is_lsn_set());
    }

    #[test]
    fn test_bodies_round_trip_through_json() {
        let body = ConfigurationMessageBody {
            fu_desc: FailoverUnitDescription::new(FailoverUnitId::new_random(), Epoch::new(1, 0)),
            service_desc: ServiceDescription::new("svc", "Echo", 3, 2, true),
            replicas: vec![ReplicaDescription::new(NodeInstance::new(1, 1), 1, 1)],
        };
        let json = serde_json::to_string(&body).unwrap();
        let parsed: ConfigurationMessageBody = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, body);
    }
}
