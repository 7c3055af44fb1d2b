use crate::replica::Replica;
use serde::{Deserialize, Serialize};

/// Ordered collection of the replicas of one failover unit.
///
/// Partitions the set into three logical views: the local replica (exactly
/// one while the unit is open), configuration replicas (a Secondary/Primary
/// role in PC or CC), and idle replicas (being built, no configuration
/// role). The physical vector and the union of the views must always be the
/// same set; the invariant layer checks this.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaStore {
    replicas: Vec<Replica>,
    local_replica_id: i64,
}

impl ReplicaStore {
    pub fn new(local_replica_id: i64) -> Self {
        Self {
            replicas: Vec::new(),
            local_replica_id,
        }
    }

    pub fn set_local_replica_id(&mut self, local_replica_id: i64) {
        self.local_replica_id = local_replica_id;
    }

    pub fn local_replica_id(&self) -> i64 {
        self.local_replica_id
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn clear(&mut self) {
        self.replicas.clear();
    }

    pub fn add(&mut self, replica: Replica) -> &mut Replica {
        self.replicas.push(replica);
        let idx = self.replicas.len() - 1;
        &mut self.replicas[idx]
    }

    pub fn remove(&mut self, replica_id: i64) {
        self.replicas.retain(|r| r.replica_id != replica_id);
    }

    pub fn retain<F: FnMut(&Replica) -> bool>(&mut self, f: F) {
        self.replicas.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        self.replicas.iter_mut()
    }

    pub fn get(&self, replica_id: i64) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.replica_id == replica_id)
    }

    pub fn get_mut(&mut self, replica_id: i64) -> Option<&mut Replica> {
        self.replicas
            .iter_mut()
            .find(|r| r.replica_id == replica_id)
    }

    pub fn local_replica(&self) -> Option<&Replica> {
        self.get(self.local_replica_id)
    }

    pub fn local_replica_mut(&mut self) -> Option<&mut Replica> {
        let id = self.local_replica_id;
        self.get_mut(id)
    }

    pub fn is_local(&self, replica: &Replica) -> bool {
        replica.replica_id == self.local_replica_id
    }

    pub fn configuration_replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_in_configuration())
    }

    pub fn configuration_remote_replicas(&self) -> impl Iterator<Item = &Replica> {
        let local = self.local_replica_id;
        self.replicas
            .iter()
            .filter(move |r| r.is_in_configuration() && r.replica_id != local)
    }

    pub fn configuration_remote_replicas_mut(&mut self) -> impl Iterator<Item = &mut Replica> {
        let local = self.local_replica_id;
        self.replicas
            .iter_mut()
            .filter(move |r| r.is_in_configuration() && r.replica_id != local)
    }

    pub fn idle_replicas(&self) -> impl Iterator<Item = &Replica> {
        let local = self.local_replica_id;
        self.replicas
            .iter()
            .filter(move |r| !r.is_in_configuration() && r.replica_id != local)
    }

    pub fn clear_idle_replicas(&mut self) {
        let local = self.local_replica_id;
        self.replicas
            .retain(|r| r.is_in_configuration() || r.replica_id == local);
    }

    /// True when the physical vector equals the union of the three views.
    /// Trivially true with the current filter-based views; kept as an
    /// executable statement of the contract for the invariant layer.
    pub fn is_partition_consistent(&self) -> bool {
        let local = usize::from(self.local_replica().is_some());
        let config = self.configuration_remote_replicas().count();
        let idle = self.idle_replicas().count();
        local + config + idle == self.replicas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInstance;
    use crate::replica::ReplicaRole;

    fn store_with(roles: &[(i64, ReplicaRole)]) -> ReplicaStore {
        let mut store = ReplicaStore::new(1);
        for (id, role) in roles {
            let mut r = Replica::new(*id, *id, NodeInstance::new(*id as u64, 1));
            r.current_configuration_role = *role;
            store.add(r);
        }
        store
    }

    #[test]
    fn test_views_partition_the_store() {
        let store = store_with(&[
            (1, ReplicaRole::Primary),
            (2, ReplicaRole::Secondary),
            (3, ReplicaRole::Idle),
        ]);

        assert_eq!(store.local_replica().map(|r| r.replica_id), Some(1));
        assert_eq!(store.configuration_remote_replicas().count(), 1);
        assert_eq!(store.idle_replicas().count(), 1);
        assert!(store.is_partition_consistent());
    }

    #[test]
    fn test_clear_idle_replicas_keeps_local_and_configuration() {
        let mut store = store_with(&[
            (1, ReplicaRole::None),
            (2, ReplicaRole::Secondary),
            (3, ReplicaRole::Idle),
        ]);

        store.clear_idle_replicas();
        assert_eq!(store.len(), 2);
        assert!(store.get(3).is_none());
        assert!(store.local_replica().is_some());
    }

    #[test]
    fn test_remove() {
        let mut store = store_with(&[(1, ReplicaRole::Primary), (2, ReplicaRole::Secondary)]);
        store.remove(2);
        assert_eq!(store.len(), 1);
        assert!(store.get(2).is_none());
    }
}
