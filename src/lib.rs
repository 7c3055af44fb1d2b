//! Per-partition reconfiguration engine for a replicated cluster fabric.
//!
//! The crate is a pure state machine: one [`FailoverUnit`] per partition
//! owns the replica set and the reconfiguration protocol (progress poll,
//! catchup, deactivate, activate, and the demote/abort-demote path of a
//! primary swap). Every protocol call takes an [`ExecutionContext`] and
//! records its intended side effects in an [`ActionQueue`]; transport,
//! persistence, timers and the replicator itself belong to the hosting
//! agent.

pub mod actions;
pub mod config;
pub mod context;
pub mod endpoint_publish;
pub mod epoch;
pub mod error;
pub mod failover_unit;
pub mod fm_message_state;
pub mod messages;
pub mod node;
pub mod reconfig_state;
pub mod replica;
pub mod replica_store;
pub mod replica_upload;
pub mod retryable_error;
pub mod service_type;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::{
    ActionQueue, FmMessage, PeerMessage, ProxyMessage, ReplicaHealthEvent, StateMachineAction,
    TraceRecord, UpdateConfigurationReason,
};
pub use config::{ReconfigurationConfig, RetryThresholds};
pub use context::{ExecutionContext, UpdateContext};
pub use epoch::{Epoch, Lsn, ReplicaDeactivationInfo, INVALID_LSN, UNKNOWN_LSN};
pub use error::{ErrorCode, ReconfigError, ReconfigResult};
pub use failover_unit::{FailoverUnit, ReplicaCloseMode, ReplicaOpenMode, ReplicaSetCounts};
pub use messages::{
    ConfigurationMessageBody, ConfigurationReplyMessageBody, DoReconfigurationMessageBody,
    FailoverUnitDescription, FailoverUnitId, FailoverUnitInfo, ProxyReplyMessageBody,
    ProxyUpdateServiceDescriptionReplyMessageBody, ReplicaDescription, ReplicaMessageBody,
    ReplicaReplyMessageBody, ServiceDescription,
};
pub use node::{NodeId, NodeInstance};
pub use reconfig_state::{
    PhaseDurations, ReconfigurationResult, ReconfigurationStage, ReconfigurationState,
    ReconfigurationType,
};
pub use replica::{Replica, ReplicaMessageStage, ReplicaRole, ReplicaState};
pub use service_type::{HostingAdapter, ServiceTypeRegistration};
