use super::FailoverUnit;
use crate::reconfig_state::{ReconfigurationResult, ReconfigurationStage};
use crate::replica::ReplicaRole;

/// Debug-build consistency checks run after every mutating protocol call.
/// Each violated assertion is a coding error in the engine, never a
/// legitimate runtime state.
impl FailoverUnit {
    pub(crate) fn assert_invariants(&self) {
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    fn check_invariants(&self) {
        if self.is_closed() {
            debug_assert!(
                self.replica_store.is_empty(),
                "closed unit holds replicas {}",
                self
            );
            debug_assert!(
                !self.reconfig_state.is_reconfiguring(),
                "closed unit reconfiguring {}",
                self
            );
            debug_assert!(
                !self.local_replica_open_pending && !self.local_replica_close_pending,
                "closed unit has open/close pending {}",
                self
            );
            debug_assert!(
                !self.local_replica_open,
                "closed unit marked open {}",
                self
            );
            return;
        }

        self.check_epochs();
        self.check_replica_flags();
        self.check_role_uniqueness();

        debug_assert!(
            self.replica_store.is_partition_consistent(),
            "replica store inconsistent {}",
            self
        );
        debug_assert!(
            self.replica_store.local_replica().is_some(),
            "open unit without local replica {}",
            self
        );
    }

    fn check_epochs(&self) {
        let pc = self.fu_desc.previous_configuration_epoch;
        let ic = self.fu_desc.intermediate_configuration_epoch;
        let cc = self.fu_desc.current_configuration_epoch;

        debug_assert!(cc.is_valid(), "open unit with invalid CC epoch {}", self);

        match self.reconfig_state.stage() {
            ReconfigurationStage::None => {
                // A completed demote keeps both configurations until the
                // swap continues on the new primary.
                if self.reconfig_state.result() != ReconfigurationResult::DemoteCompleted {
                    debug_assert!(
                        !pc.is_valid() && !ic.is_valid(),
                        "PC/IC epoch outside reconfiguration {}",
                        self
                    );
                }
            }
            ReconfigurationStage::Phase0Demote
            | ReconfigurationStage::Phase1GetLsn
            | ReconfigurationStage::Phase2Catchup
            | ReconfigurationStage::AbortPhase0Demote => {
                debug_assert!(pc.is_valid(), "reconfiguring without PC epoch {}", self);
                debug_assert!(
                    !ic.is_valid(),
                    "IC epoch before deactivation phase {}",
                    self
                );
            }
            ReconfigurationStage::Phase3Deactivate | ReconfigurationStage::Phase4Activate => {
                debug_assert!(pc.is_valid(), "reconfiguring without PC epoch {}", self);
                debug_assert!(
                    ic.is_valid(),
                    "deactivation phase without IC epoch {}",
                    self
                );
            }
        }
    }

    fn check_replica_flags(&self) {
        let stage = self.reconfig_state.stage();
        let local_id = self.replica_store.local_replica_id();

        let deactivate_legal = matches!(
            stage,
            ReconfigurationStage::Phase0Demote
                | ReconfigurationStage::Phase2Catchup
                | ReconfigurationStage::Phase3Deactivate
        );
        let activate_legal = matches!(
            stage,
            ReconfigurationStage::Phase4Activate | ReconfigurationStage::None
        );
        let restart_legal = matches!(
            stage,
            ReconfigurationStage::Phase0Demote
                | ReconfigurationStage::Phase2Catchup
                | ReconfigurationStage::Phase3Deactivate
                | ReconfigurationStage::Phase4Activate
        );

        for replica in self.replica_store.iter() {
            if replica.to_be_deactivated {
                debug_assert!(
                    deactivate_legal,
                    "to_be_deactivated in {} {}",
                    stage, self
                );
            }
            if replica.to_be_activated {
                debug_assert!(activate_legal, "to_be_activated in {} {}", stage, self);
            }
            if replica.to_be_restarted {
                debug_assert!(restart_legal, "to_be_restarted in {} {}", stage, self);
            }

            if replica.to_be_activated || replica.to_be_deactivated || replica.to_be_restarted {
                debug_assert!(
                    replica.replica_id != local_id,
                    "protocol flag on local replica {}",
                    self
                );
                debug_assert!(
                    replica.is_up,
                    "protocol flag on down replica {} {}",
                    replica, self
                );
            }
        }
    }

    fn check_role_uniqueness(&self) {
        let mut pc_primaries = 0usize;
        let mut ic_primaries = 0usize;
        let mut cc_primaries = 0usize;
        for replica in self.replica_store.iter() {
            if replica.previous_configuration_role == ReplicaRole::Primary {
                pc_primaries += 1;
            }
            if replica.intermediate_configuration_role == ReplicaRole::Primary {
                ic_primaries += 1;
            }
            if replica.current_configuration_role == ReplicaRole::Primary {
                cc_primaries += 1;
            }
        }
        debug_assert!(pc_primaries <= 1, "multiple PC primaries {}", self);
        debug_assert!(ic_primaries <= 1, "multiple IC primaries {}", self);
        debug_assert!(cc_primaries <= 1, "multiple CC primaries {}", self);
    }
}
