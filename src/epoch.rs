use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Log sequence number: a replica's replication progress marker.
pub type Lsn = i64;

/// No progress information available.
pub const INVALID_LSN: Lsn = -1;

/// The replica answered the progress query but could not determine its
/// position (for example, a standby that lost its replicator session).
pub const UNKNOWN_LSN: Lsn = -2;

/// A configuration epoch: (configuration-version, data-loss-version).
/// Ordered by configuration version first. Each accepted reconfiguration
/// bumps the configuration version; each detected data loss bumps the
/// data-loss version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Epoch {
    pub configuration_version: i64,
    pub data_loss_version: i64,
}

impl Epoch {
    pub const fn new(configuration_version: i64, data_loss_version: i64) -> Self {
        Self {
            configuration_version,
            data_loss_version,
        }
    }

    pub const fn invalid() -> Self {
        Self::new(0, 0)
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }

    /// Comparison that ignores the data-loss version. Used wherever only the
    /// primacy of a configuration matters, e.g. deactivation-epoch
    /// filtering during election.
    pub fn compare_primary(&self, other: &Epoch) -> Ordering {
        self.configuration_version.cmp(&other.configuration_version)
    }

    pub fn is_primary_epoch_equal(&self, other: &Epoch) -> bool {
        self.compare_primary(other) == Ordering::Equal
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.configuration_version
            .cmp(&other.configuration_version)
            .then(self.data_loss_version.cmp(&other.data_loss_version))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.configuration_version, self.data_loss_version)
    }
}

/// Certifies the latest point up to which a replica's acknowledged data is
/// trusted: the epoch in which the replica last completed catchup, and the
/// LSN it was caught up to. A replica claiming progress beyond what its
/// deactivation info certifies is a false-progress suspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDeactivationInfo {
    pub deactivation_epoch: Epoch,
    pub catchup_lsn: Lsn,
}

impl ReplicaDeactivationInfo {
    pub const fn new(deactivation_epoch: Epoch, catchup_lsn: Lsn) -> Self {
        Self {
            deactivation_epoch,
            catchup_lsn,
        }
    }

    /// No information. Replicas reported by protocol versions that predate
    /// deactivation info carry this; the receiver synthesizes one from the
    /// sender's epoch and acknowledged progress.
    pub const fn empty() -> Self {
        Self::new(Epoch::invalid(), INVALID_LSN)
    }

    /// The local replica is dropped.
    pub const fn dropped() -> Self {
        Self::new(Epoch::new(-1, -1), INVALID_LSN)
    }

    pub fn is_valid(&self) -> bool {
        self.deactivation_epoch.is_valid() && !self.is_dropped()
    }

    pub fn is_dropped(&self) -> bool {
        self.deactivation_epoch == Epoch::new(-1, -1)
    }
}

impl Default for ReplicaDeactivationInfo {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for ReplicaDeactivationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dropped() {
            write!(f, "dropped")
        } else if !self.is_valid() {
            write!(f, "empty")
        } else {
            write!(f, "{}:{}", self.deactivation_epoch, self.catchup_lsn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_ordering_configuration_version_first() {
        let a = Epoch::new(5, 1);
        let b = Epoch::new(6, 0);
        assert!(a < b);

        let c = Epoch::new(5, 2);
        assert!(a < c);
    }

    #[test]
    fn test_primary_epoch_comparison_ignores_data_loss() {
        let a = Epoch::new(5, 1);
        let b = Epoch::new(5, 9);
        assert!(a.is_primary_epoch_equal(&b));
        assert_eq!(a.compare_primary(&Epoch::new(6, 0)), Ordering::Less);
    }

    #[test]
    fn test_invalid_epoch() {
        assert!(!Epoch::invalid().is_valid());
        assert!(Epoch::new(1, 0).is_valid());
    }

    #[test]
    fn test_deactivation_info_sentinels() {
        assert!(!ReplicaDeactivationInfo::empty().is_valid());
        assert!(!ReplicaDeactivationInfo::empty().is_dropped());
        assert!(ReplicaDeactivationInfo::dropped().is_dropped());
        assert!(ReplicaDeactivationInfo::new(Epoch::new(3, 1), 100).is_valid());
    }
}
