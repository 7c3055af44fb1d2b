//! Shared fixtures for unit tests: a scripted hosting stub, an execution
//! harness that collects the actions of one call, and builders for open
//! units in common starting states.

use crate::actions::{ActionQueue, StateMachineAction};
use crate::config::ReconfigurationConfig;
use crate::context::ExecutionContext;
use crate::epoch::Epoch;
use crate::error::ReconfigResult;
use crate::failover_unit::{FailoverUnit, FailoverUnitLifeState};
use crate::messages::{
    DoReconfigurationMessageBody, FailoverUnitId, ReplicaDescription, ServiceDescription,
};
use crate::node::{NodeId, NodeInstance};
use crate::replica::{Replica, ReplicaRole, ReplicaState};
use crate::service_type::{HostingAdapter, ServiceTypeRegistration};
use chrono::{DateTime, TimeZone, Utc};

pub const LOCAL_NODE: NodeInstance = NodeInstance {
    id: NodeId(1),
    instance: 1,
};

pub const LOCAL_REPLICA_ID: i64 = 1;

/// Hosting stub: every lookup succeeds against a fixed host.
#[derive(Debug, Default)]
pub struct StubHosting {
    pub releases: usize,
}

impl HostingAdapter for StubHosting {
    fn find_service_type_registration(
        &mut self,
        service_type: &str,
    ) -> ReconfigResult<ServiceTypeRegistration> {
        Ok(ServiceTypeRegistration {
            service_type: service_type.to_string(),
            host_id: "host-1".into(),
            runtime_id: "rt-1".into(),
        })
    }

    fn on_registration_released(&mut self, _registration: &ServiceTypeRegistration) {
        self.releases += 1;
    }
}

/// Drives one state-machine call at a time and hands back the actions it
/// produced. Advance `now` directly to simulate elapsed time.
pub struct TestHost {
    pub now: DateTime<Utc>,
    pub config: ReconfigurationConfig,
    pub hosting: StubHosting,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            config: ReconfigurationConfig::default(),
            hosting: StubHosting::default(),
        }
    }

    pub fn call<R>(
        &mut self,
        f: impl FnOnce(&mut ExecutionContext<'_>) -> R,
    ) -> Vec<StateMachineAction> {
        let mut queue = ActionQueue::new();
        let mut context = ExecutionContext::new(
            self.now,
            &self.config,
            LOCAL_NODE,
            &mut queue,
            &mut self.hosting,
        );
        f(&mut context);
        queue.drain()
    }
}

fn open_unit(local_role: ReplicaRole, peers: &[(i64, ReplicaRole)]) -> FailoverUnit {
    let service = ServiceDescription::new("fabric:/test/svc", "Echo", peers.len() + 1, 2, true);
    let mut unit = FailoverUnit::new(FailoverUnitId::new_random(), service);

    let mut desc = *unit.description();
    desc.current_configuration_epoch = Epoch::new(1, 0);
    unit.fu_desc = desc;

    unit.state = FailoverUnitLifeState::Open;
    unit.local_replica_id = LOCAL_REPLICA_ID;
    unit.local_replica_instance_id = 1;
    unit.local_replica_open = true;
    unit.replica_store.set_local_replica_id(LOCAL_REPLICA_ID);

    let mut local = Replica::new(LOCAL_REPLICA_ID, 1, LOCAL_NODE);
    local.current_configuration_role = local_role;
    local.state = ReplicaState::Ready;
    unit.replica_store.add(local);

    for &(id, role) in peers {
        let mut replica = Replica::new(id, id, NodeInstance::new(id as u64, 1));
        replica.current_configuration_role = role;
        replica.state = ReplicaState::Ready;
        unit.replica_store.add(replica);
    }

    unit.assert_invariants();
    unit
}

/// An open, stable unit with the local replica as ready primary.
pub fn open_primary_with_secondaries(secondary_ids: &[i64]) -> FailoverUnit {
    let peers: Vec<(i64, ReplicaRole)> = secondary_ids
        .iter()
        .map(|&id| (id, ReplicaRole::Secondary))
        .collect();
    open_unit(ReplicaRole::Primary, &peers)
}

/// An open, stable unit with the local replica as ready secondary; the
/// first peer is the primary.
pub fn open_secondary_with_peers(peer_ids: &[i64]) -> FailoverUnit {
    let peers: Vec<(i64, ReplicaRole)> = peer_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| {
            let role = if i == 0 {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            (id, role)
        })
        .collect();
    open_unit(ReplicaRole::Secondary, &peers)
}

/// A failover request promoting the local replica to primary: the stored
/// roles become the previous configuration and the local replica takes the
/// primary slot in the new one.
pub fn failover_body(unit: &FailoverUnit) -> DoReconfigurationMessageBody {
    let mut replicas: Vec<ReplicaDescription> =
        unit.replicas().map(ReplicaDescription::from).collect();
    for desc in &mut replicas {
        desc.previous_configuration_role = desc.current_configuration_role;
        desc.current_configuration_role = if desc.replica_id == unit.local_replica_id() {
            ReplicaRole::Primary
        } else {
            ReplicaRole::Secondary
        };
    }

    let mut fu_desc = *unit.description();
    fu_desc.previous_configuration_epoch = fu_desc.current_configuration_epoch;
    fu_desc.current_configuration_epoch = Epoch::new(
        fu_desc.current_configuration_epoch.configuration_version + 1,
        fu_desc.current_configuration_epoch.data_loss_version,
    );
    DoReconfigurationMessageBody {
        fu_desc,
        service_desc: unit.service_description().clone(),
        replicas,
        phase0_duration: None,
    }
}
