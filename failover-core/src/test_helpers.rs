//! Test doubles and a deterministic two-node simulator
//!
//! [`RecordingLink`] and [`RecordingSpawner`] stand in for the transport and
//! the process layer. [`TestCluster`] wires two engines to a shared
//! [`MockClock`] and shuttles broadcasts between them, the sender included,
//! so whole negotiations can be driven without sockets or children.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::abstractions::{ChildExit, CommandSpec, ExitStatus, MockClock, ProcessHandle, ProcessSpawner};
use crate::config::FailoverConfig;
use crate::deferred_queue::NotificationFilter;
use crate::engine::FailoverEngine;
use crate::error::{FailoverError, FailoverResult};
use crate::link::ClusterLink;
use crate::message::{ClusterMessage, Envelope, STATUS_ACTIVE};

/// Link that records everything instead of sending it
#[derive(Debug, Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<ClusterMessage>>,
    local: Mutex<Vec<Envelope>>,
    fail_sends: AtomicBool,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Broadcasts sent so far, without draining them
    pub fn sent(&self) -> Vec<ClusterMessage> {
        self.sent.lock().clone()
    }

    /// Drain recorded broadcasts
    pub fn take_sent(&self) -> Vec<ClusterMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn local_deliveries(&self) -> Vec<Envelope> {
        self.local.lock().clone()
    }
}

impl ClusterLink for RecordingLink {
    fn send(&self, message: &ClusterMessage) -> FailoverResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(FailoverError::link("sends disabled"));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn deliver_local(&self, envelope: &Envelope) {
        self.local.lock().push(envelope.clone());
    }
}

#[derive(Debug, Clone)]
pub struct SpawnedChild {
    pub handle: ProcessHandle,
    pub cmd: CommandSpec,
}

impl SpawnedChild {
    pub fn exit(&self, status: ExitStatus) -> ChildExit {
        ChildExit {
            handle: self.handle,
            status,
        }
    }
}

/// Spawner that records commands and hands out fake pids
#[derive(Debug)]
pub struct RecordingSpawner {
    spawned: Mutex<Vec<SpawnedChild>>,
    next_pid: AtomicU32,
    fail: AtomicBool,
}

impl Default for RecordingSpawner {
    fn default() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(1000),
            fail: AtomicBool::new(false),
        }
    }
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<SpawnedChild> {
        self.spawned.lock().clone()
    }

    /// Drain children started since the last call
    pub fn take(&self) -> Vec<SpawnedChild> {
        std::mem::take(&mut *self.spawned.lock())
    }
}

impl ProcessSpawner for RecordingSpawner {
    fn spawn(&self, handle: ProcessHandle, cmd: &CommandSpec) -> FailoverResult<u32> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FailoverError::spawn(
                cmd.display(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "spawning disabled"),
            ));
        }
        self.spawned.lock().push(SpawnedChild {
            handle,
            cmd: cmd.clone(),
        });
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}

/// One simulated member
pub struct SimNode {
    pub engine: FailoverEngine,
    pub link: Arc<RecordingLink>,
    pub spawner: Arc<RecordingSpawner>,
    /// Children started but not yet completed
    pub running: Vec<SpawnedChild>,
    pub alive: bool,
    /// Links brought up; only started nodes hear broadcasts
    pub started: bool,
}

impl SimNode {
    fn new(config: FailoverConfig, clock: &MockClock) -> Self {
        let link = Arc::new(RecordingLink::new());
        let spawner = Arc::new(RecordingSpawner::new());
        let engine = FailoverEngine::new(
            config,
            Arc::new(clock.clone()),
            link.clone(),
            spawner.clone(),
        )
        .expect("test config is valid")
        .with_notification_filter(NotificationFilter::Only(Default::default()));
        Self {
            engine,
            link,
            spawner,
            running: Vec::new(),
            alive: true,
            started: false,
        }
    }

    fn collect_children(&mut self) {
        self.running.extend(self.spawner.take());
    }

    /// Commands started on this node so far, as shell text
    pub fn started_commands(&self) -> Vec<String> {
        self.running.iter().map(|c| c.cmd.display()).collect()
    }
}

/// Two engines joined by an in-memory broadcast medium
pub struct TestCluster {
    pub clock: MockClock,
    nodes: Vec<(String, SimNode)>,
    configs: Vec<FailoverConfig>,
    /// Every message delivered so far, in order
    pub history: Vec<Envelope>,
}

impl TestCluster {
    pub fn new(a: FailoverConfig, b: FailoverConfig) -> Self {
        let clock = MockClock::new();
        let nodes = [&a, &b]
            .into_iter()
            .map(|c| (c.node_name.clone(), SimNode::new(c.clone(), &clock)))
            .collect();
        Self {
            clock,
            nodes,
            configs: vec![a, b],
            history: Vec::new(),
        }
    }

    /// `alpha` and `beta` with the given failback policy
    pub fn pair(nice_failback: bool, auto_failback: bool) -> Self {
        let mut a = FailoverConfig::test("alpha", "beta");
        let mut b = FailoverConfig::test("beta", "alpha");
        for config in [&mut a, &mut b] {
            config.failback.nice_failback = nice_failback;
            config.failback.auto_failback = auto_failback;
        }
        Self::new(a, b)
    }

    pub fn node(&self, name: &str) -> &SimNode {
        self.nodes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
            .unwrap_or_else(|| panic!("unknown node {}", name))
    }

    pub fn node_mut(&mut self, name: &str) -> &mut SimNode {
        self.nodes
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
            .unwrap_or_else(|| panic!("unknown node {}", name))
    }

    pub fn engine(&self, name: &str) -> &FailoverEngine {
        &self.node(name).engine
    }

    pub fn engine_mut(&mut self, name: &str) -> &mut FailoverEngine {
        &mut self.node_mut(name).engine
    }

    fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|(n, _)| n.clone()).collect()
    }

    fn other(&self, name: &str) -> String {
        self.names()
            .into_iter()
            .find(|n| n != name)
            .unwrap_or_else(|| panic!("no peer for {}", name))
    }

    /// Bring links up on every live node at once
    pub fn start(&mut self) {
        for (_, node) in self.nodes.iter_mut().filter(|(_, n)| n.alive) {
            node.started = true;
        }
        for name in self.names() {
            if self.node(&name).alive {
                self.links_up(&name);
            }
        }
    }

    /// Bring links up on `name` alone
    pub fn start_node(&mut self, name: &str) {
        self.node_mut(name).started = true;
        self.links_up(name);
    }

    fn links_up(&mut self, name: &str) {
        let up: Vec<String> = self
            .nodes
            .iter()
            .filter(|(n, node)| n != name && node.alive && node.started)
            .map(|(n, _)| n.clone())
            .collect();
        let node = self.node_mut(name);
        node.engine.links_up(&up);
        node.collect_children();
    }

    /// Deliver pending broadcasts until none are left. Returns how many
    /// were delivered.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut batch = Vec::new();
            for (name, node) in self.nodes.iter() {
                for message in node.link.take_sent() {
                    if node.alive {
                        batch.push(Envelope::new(name.as_str(), message));
                    }
                }
            }
            if batch.is_empty() {
                return delivered;
            }
            for envelope in batch {
                for (_, node) in self
                    .nodes
                    .iter_mut()
                    .filter(|(_, n)| n.alive && n.started)
                {
                    node.engine.handle_message(envelope.clone());
                    node.collect_children();
                }
                self.history.push(envelope);
                delivered += 1;
            }
        }
    }

    /// Complete every running child on `name` with `status`
    pub fn finish_children(&mut self, name: &str, status: ExitStatus) -> usize {
        let node = self.node_mut(name);
        node.collect_children();
        let children = std::mem::take(&mut node.running);
        let count = children.len();
        for child in children {
            node.engine.child_exited(child.exit(status));
            node.collect_children();
        }
        count
    }

    /// Deliver messages and succeed children until nothing moves
    pub fn settle(&mut self) {
        for _ in 0..200 {
            let mut progress = self.deliver();
            for name in self.names() {
                if self.node(&name).alive && self.node(&name).started {
                    progress += self.finish_children(&name, ExitStatus::Exited(0));
                }
            }
            if progress == 0 {
                return;
            }
        }
        panic!("cluster did not settle");
    }

    /// Advance the shared clock and fire timers on live nodes
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        for (_, node) in self
            .nodes
            .iter_mut()
            .filter(|(_, n)| n.alive && n.started)
        {
            node.engine.tick();
            node.collect_children();
        }
    }

    /// Stop `name` without warning; the survivor sees it die
    pub fn kill(&mut self, name: &str) {
        let other = self.other(name);
        {
            let node = self.node_mut(name);
            node.alive = false;
            node.running.clear();
            node.link.take_sent();
        }
        let survivor = self.node_mut(&other);
        if survivor.alive && survivor.started {
            survivor.engine.node_dead(name);
            survivor.collect_children();
        }
    }

    /// Replace `name` with a fresh engine and bring its links up
    pub fn restart(&mut self, name: &str) {
        let config = self
            .configs
            .iter()
            .find(|c| c.node_name == name)
            .cloned()
            .unwrap_or_else(|| panic!("unknown node {}", name));
        let fresh = SimNode::new(config, &self.clock);
        *self.node_mut(name) = fresh;

        let other = self.other(name);
        let survivor = self.node_mut(&other);
        if survivor.alive && survivor.started {
            survivor.engine.handle_message(Envelope::new(
                name,
                ClusterMessage::Status {
                    status: STATUS_ACTIVE.to_string(),
                    ping: false,
                },
            ));
            survivor.collect_children();
        }
        self.start_node(name);
    }
}
