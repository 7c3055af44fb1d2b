use crate::actions::ActionQueue;
use crate::config::ReconfigurationConfig;
use crate::node::NodeInstance;
use crate::service_type::HostingAdapter;
use chrono::{DateTime, Utc};

/// Records whether the call mutated persisted state; the hosting agent
/// commits the entity to the local store when set.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateContext {
    update_enabled: bool,
}

impl UpdateContext {
    pub fn enable_update(&mut self) {
        self.update_enabled = true;
    }

    pub fn is_update_enabled(&self) -> bool {
        self.update_enabled
    }
}

/// Everything one state-machine call may consult or append to: the clock
/// reading taken at dispatch, configuration, the local node identity, the
/// action queue, the persistence tracker and the hosting adapter.
///
/// Borrowed for the duration of a single call; the engine never retains any
/// part of it.
pub struct ExecutionContext<'a> {
    pub now: DateTime<Utc>,
    pub config: &'a ReconfigurationConfig,
    pub node_instance: NodeInstance,
    pub queue: &'a mut ActionQueue,
    pub update: UpdateContext,
    pub hosting: &'a mut dyn HostingAdapter,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        now: DateTime<Utc>,
        config: &'a ReconfigurationConfig,
        node_instance: NodeInstance,
        queue: &'a mut ActionQueue,
        hosting: &'a mut dyn HostingAdapter,
    ) -> Self {
        Self {
            now,
            config,
            node_instance,
            queue,
            update: UpdateContext::default(),
            hosting,
        }
    }
}
