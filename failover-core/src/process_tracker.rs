//! Process tracker
//!
//! Every child the engine starts goes through here. The tracker keeps the
//! purpose of each running child so its exit can be dispatched, and counts
//! the resource-management children that gate quiescence.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error, warn};

use crate::abstractions::{CommandSpec, Instant, ProcessHandle, ProcessSpawner};
use crate::error::FailoverResult;

/// A running child owned by the tracker
#[derive(Debug, Clone)]
pub struct TrackedProcess<P> {
    pub handle: ProcessHandle,
    pub pid: u32,
    pub purpose: P,
    /// Counted as resource-management work
    pub managed: bool,
    pub started_at: Instant,
}

#[derive(Debug)]
pub struct ProcessTracker<P> {
    next_handle: u64,
    running: BTreeMap<ProcessHandle, TrackedProcess<P>>,
    management_children: usize,
}

impl<P> Default for ProcessTracker<P> {
    fn default() -> Self {
        Self {
            next_handle: 1,
            running: BTreeMap::new(),
            management_children: 0,
        }
    }
}

impl<P: fmt::Display> ProcessTracker<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a child. A spawn failure is logged here and returned; the
    /// caller treats the action as not having happened.
    pub fn spawn(
        &mut self,
        spawner: &dyn ProcessSpawner,
        cmd: &CommandSpec,
        purpose: P,
        managed: bool,
        now: Instant,
    ) -> FailoverResult<ProcessHandle> {
        let handle = ProcessHandle(self.next_handle);
        self.next_handle += 1;

        let pid = spawner.spawn(handle, cmd).map_err(|e| {
            error!(purpose = %purpose, error = %e, "Cannot start child process");
            e
        })?;

        debug!(purpose = %purpose, pid, %handle, "Process started");
        if managed {
            self.management_children += 1;
        }
        self.running.insert(
            handle,
            TrackedProcess {
                handle,
                pid,
                purpose,
                managed,
                started_at: now,
            },
        );
        Ok(handle)
    }

    /// Remove a finished child. Returns `None` for a handle that is not
    /// running, so each exit is dispatched at most once.
    pub fn complete(&mut self, handle: ProcessHandle) -> Option<TrackedProcess<P>> {
        match self.running.remove(&handle) {
            Some(process) => {
                if process.managed {
                    self.management_children = self.management_children.saturating_sub(1);
                }
                Some(process)
            }
            None => {
                warn!(%handle, "Exit reported for unknown or already completed child");
                None
            }
        }
    }

    pub fn active_management_count(&self) -> usize {
        self.management_children
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
