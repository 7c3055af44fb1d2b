use serde::{Deserialize, Serialize};

/// Tracks the initial upload of a failover unit to the failover manager
/// after node start. Until the upload is acknowledged the manager does not
/// know the unit exists on this node, so other reports wait behind it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicaUploadState {
    upload_pending: bool,
    uploaded: bool,
    /// Upload was requested while the replica could not report yet (still
    /// reopening); it happens when the replica next opens.
    deferred: bool,
}

impl ReplicaUploadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_upload_pending(&self) -> bool {
        self.upload_pending
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn on_upload_pending(&mut self) {
        if !self.uploaded {
            self.upload_pending = true;
        }
    }

    pub fn on_deferred_upload_required(&mut self) {
        if !self.uploaded {
            self.deferred = true;
        }
    }

    /// The deferred upload becomes a real one (replica opened).
    pub fn on_deferred_upload_ready(&mut self) -> bool {
        if self.deferred && !self.uploaded {
            self.deferred = false;
            self.upload_pending = true;
            true
        } else {
            false
        }
    }

    pub fn on_uploaded(&mut self) {
        self.upload_pending = false;
        self.deferred = false;
        self.uploaded = true;
    }
}
