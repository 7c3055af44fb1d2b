use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a node within the cluster fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node id plus its incarnation. A node that restarts comes back with a
/// higher instance; messages from an older instance are stale.
///
/// There is deliberately no invalid-node constant: callers that may have no
/// sender use `Option<NodeInstance>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeId,
    pub instance: u64,
}

impl NodeInstance {
    pub fn new(id: u64, instance: u64) -> Self {
        Self {
            id: NodeId(id),
            instance,
        }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let node = NodeInstance::new(42, 3);
        assert_eq!(node.to_string(), "42:3");
    }

    #[test]
    fn test_instance_ordering() {
        let old = NodeInstance::new(7, 1);
        let new = NodeInstance::new(7, 2);
        assert_eq!(old.id, new.id);
        assert!(old.instance < new.instance);
    }
}
