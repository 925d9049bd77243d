//! Deferred request queue
//!
//! Notification jobs are run one at a time and never alongside other
//! resource-management children. A job whose message type has no script in
//! the notification directory is dropped at enqueue time.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, warn};

use crate::abstractions::Instant;
use crate::message::Envelope;
use crate::resource::ResourceClass;

/// Set of message types that have a notification script
#[derive(Debug, Clone)]
pub enum NotificationFilter {
    AllowAll,
    Only(HashSet<String>),
}

impl NotificationFilter {
    /// Build from the entries of `dir`; hidden entries are skipped. A
    /// missing directory lets nothing through.
    pub fn from_dir(dir: &Path) -> Self {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot open notification directory");
                return NotificationFilter::Only(HashSet::new());
            }
        };

        let names = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .inspect(|name| debug!(name = %name, "Notification script registered"))
            .collect();
        NotificationFilter::Only(names)
    }

    pub fn allows(&self, msg_type: &str) -> bool {
        match self {
            NotificationFilter::AllowAll => true,
            NotificationFilter::Only(names) => names.contains(msg_type),
        }
    }
}

/// A queued notification job
#[derive(Debug, Clone)]
pub struct DeferredRequest {
    pub envelope: Envelope,
    /// Our held class when the triggering event arrived
    pub held_before: ResourceClass,
    /// Dead node whose takeover completes with this notification
    pub takeover_of: Option<String>,
    pub queued_at: Instant,
}

#[derive(Debug)]
pub struct DeferredQueue {
    pending: VecDeque<DeferredRequest>,
    filter: NotificationFilter,
}

impl DeferredQueue {
    pub fn new(filter: NotificationFilter) -> Self {
        Self {
            pending: VecDeque::new(),
            filter,
        }
    }

    /// Append a job; returns false when the filter drops it
    pub fn enqueue(&mut self, request: DeferredRequest) -> bool {
        let msg_type = request.envelope.message.type_name();
        if !self.filter.allows(msg_type) {
            debug!(msg_type, "No notification script, child process unneeded");
            return false;
        }
        debug!(msg_type, depth = self.pending.len(), "Queueing deferred request");
        self.pending.push_back(request);
        true
    }

    /// Next job to run, only once no management child is active
    pub fn next_ready(&mut self, active_management: usize) -> Option<DeferredRequest> {
        if active_management != 0 {
            debug!(active_management, "Deferred request waiting for running children");
            return None;
        }
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClusterMessage;

    fn request(msg: ClusterMessage) -> DeferredRequest {
        DeferredRequest {
            envelope: Envelope::new("beta", msg),
            held_before: ResourceClass::Local,
            takeover_of: None,
            queued_at: Instant::from_micros(0),
        }
    }

    #[test]
    fn test_fifo_order_and_single_slot() {
        let mut queue = DeferredQueue::new(NotificationFilter::AllowAll);
        assert!(queue.enqueue(request(ClusterMessage::node_dead(false))));
        assert!(queue.enqueue(request(ClusterMessage::ShutdownComplete { ping: false })));

        assert!(queue.next_ready(1).is_none());
        assert_eq!(queue.len(), 2);

        let first = queue.next_ready(0).unwrap();
        assert_eq!(first.envelope.message.type_name(), "status");
        let second = queue.next_ready(0).unwrap();
        assert_eq!(second.envelope.message.type_name(), "shutdone");
        assert!(queue.next_ready(0).is_none());
    }

    #[test]
    fn test_filter_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("status"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();

        let filter = NotificationFilter::from_dir(dir.path());
        assert!(filter.allows("status"));
        assert!(!filter.allows(".hidden"));
        assert!(!filter.allows("ip-request"));

        let mut queue = DeferredQueue::new(filter);
        assert!(!queue.enqueue(request(ClusterMessage::Stonith {
            node: "beta".into(),
            result: crate::message::StonithResult::Ok,
        })));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_missing_directory_allows_nothing() {
        let filter = NotificationFilter::from_dir(Path::new("/nonexistent/rc.d"));
        assert!(!filter.allows("status"));
    }
}
