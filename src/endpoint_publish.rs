use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tracks publication of a newly elected primary's endpoint to the failover
/// manager.
///
/// The endpoint normally rides along with the reconfiguration-complete
/// report; if the reconfiguration runs long the endpoint is published early
/// once the configured wait expires, so clients can reconnect without
/// waiting for full completion.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointPublishState {
    publish_pending: bool,
    deadline: Option<DateTime<Utc>>,
}

impl EndpointPublishState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_publish_pending(&self) -> bool {
        self.publish_pending
    }

    /// The primary endpoint changed during a reconfiguration.
    pub fn on_endpoint_updated(&mut self, now: DateTime<Utc>, max_wait: Duration) {
        self.publish_pending = true;
        if self.deadline.is_none() {
            let wait = chrono::Duration::from_std(max_wait).unwrap_or(chrono::Duration::zero());
            self.deadline = Some(now + wait);
        }
    }

    /// Retry-timer check: publish early once the deadline passes while the
    /// reconfiguration is still running.
    pub fn should_publish_on_timer(&self, now: DateTime<Utc>) -> bool {
        self.publish_pending && matches!(self.deadline, Some(d) if now >= d)
    }

    /// Reconfiguration finished; a pending endpoint goes out with the
    /// completion report.
    pub fn on_reconfiguration_finished(&mut self) -> bool {
        self.deadline = None;
        self.publish_pending
    }

    pub fn on_fm_reply(&mut self) {
        self.publish_pending = false;
        self.deadline = None;
    }

    pub fn clear(&mut self) {
        self.publish_pending = false;
        self.deadline = None;
    }
}
