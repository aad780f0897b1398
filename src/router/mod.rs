//! Tag-based flood router between component mailboxes.
//!
//! Nodes are registered by mailbox. Every fixpoint pass drains all outboxes
//! and copies each message into the inbox of every node consuming its tag,
//! repeating until a pass moves nothing. Completed passes bump a generation
//! counter that the engine's phase barrier waits on.

mod service;

pub use service::RouterService;

use crate::component::{ConnectionKind, ConnectionKinds, Mailbox};
use crate::error::RouterRegistrationError;
use crate::warn_throttled;
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const BUCKETS: [ConnectionKind; 4] = [
    ConnectionKind::Input,
    ConnectionKind::Model,
    ConnectionKind::Output,
    ConnectionKind::Unknown,
];

#[inline]
fn bucket_pos(kind: ConnectionKind) -> usize {
    match kind {
        ConnectionKind::Input => 0,
        ConnectionKind::Model => 1,
        ConnectionKind::Output => 2,
        ConnectionKind::Unknown => 3,
    }
}

#[derive(Default)]
struct RouterState {
    nodes: Vec<Arc<Mailbox>>,
    by_name: AHashMap<String, usize>,
    buckets: [Vec<Arc<Mailbox>>; 4],
    routes: AHashMap<String, Vec<String>>,
}

impl RouterState {
    fn add_node(&mut self, mailbox: Arc<Mailbox>) -> bool {
        if self.by_name.contains_key(mailbox.name()) {
            return false;
        }
        for tag in mailbox.consumes() {
            let dest = self.routes.entry(tag).or_default();
            if !dest.iter().any(|n| n == mailbox.name()) {
                dest.push(mailbox.name().to_string());
            }
        }
        self.by_name
            .insert(mailbox.name().to_string(), self.nodes.len());
        self.nodes.push(mailbox);
        true
    }

    fn rebuild(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        self.by_name.clear();
        self.routes.clear();
        for node in nodes {
            self.add_node(node);
        }
    }
}

/// Flood router shared by the engine and the router service thread.
pub struct MessageRouter {
    state: RwLock<RouterState>,
    generation: Mutex<u64>,
    pass_done: Condvar,
    unrouted: AtomicU64,
    delivered: AtomicU64,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            generation: Mutex::new(0),
            pass_done: Condvar::new(),
            unrouted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Adds a node to the route table only. A node already known by name is
    /// ignored. Returns whether it was added.
    pub fn add_node(&self, mailbox: Arc<Mailbox>) -> bool {
        self.state.write().add_node(mailbox)
    }

    /// Registers a node under one capability bucket and routes its consumed
    /// tags. A second registration in the same bucket, by pointer or by name,
    /// is rejected and leaves the router untouched.
    pub fn register(
        &self,
        mailbox: Arc<Mailbox>,
        kind: ConnectionKind,
    ) -> Result<(), RouterRegistrationError> {
        if mailbox.name().is_empty() {
            return Err(RouterRegistrationError::Unnamed);
        }
        let mut state = self.state.write();
        let bucket = &state.buckets[bucket_pos(kind)];
        if bucket
            .iter()
            .any(|m| Arc::ptr_eq(m, &mailbox) || m.name() == mailbox.name())
        {
            return Err(RouterRegistrationError::Duplicate {
                name: mailbox.name().to_string(),
                bucket: kind.as_str(),
            });
        }
        state.buckets[bucket_pos(kind)].push(mailbox.clone());
        state.add_node(mailbox);
        Ok(())
    }

    /// Registers a node in every bucket its capabilities select.
    pub fn register_kinds(
        &self,
        mailbox: Arc<Mailbox>,
        kinds: ConnectionKinds,
    ) -> Result<(), RouterRegistrationError> {
        for kind in kinds.buckets() {
            self.register(mailbox.clone(), kind)?;
        }
        Ok(())
    }

    /// Removes a node from every bucket and from the route table.
    pub fn deregister(&self, name: &str) -> Result<(), RouterRegistrationError> {
        let mut state = self.state.write();
        if !state.by_name.contains_key(name) {
            return Err(RouterRegistrationError::UnknownNode(name.to_string()));
        }
        for bucket in state.buckets.iter_mut() {
            bucket.retain(|m| m.name() != name);
        }
        state.nodes.retain(|m| m.name() != name);
        state.rebuild();
        tracing::debug!("[Router] deregistered {name}");
        Ok(())
    }

    /// Re-reads every node's consumed tags.
    pub fn rebuild_routes(&self) {
        self.state.write().rebuild();
    }

    /// Names in one capability bucket, in registration order.
    pub fn nodes_in(&self, kind: ConnectionKind) -> Vec<String> {
        self.state.read().buckets[bucket_pos(kind)]
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Number of routed tags.
    pub fn route_size(&self) -> usize {
        self.state.read().routes.len()
    }

    pub fn routes_for(&self, tag: &str) -> Vec<String> {
        self.state
            .read()
            .routes
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Completed fixpoint passes.
    pub fn iterations(&self) -> u64 {
        *self.generation.lock()
    }

    /// Messages drained with no subscriber.
    pub fn unrouted(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    /// Inbox deliveries so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// One fixpoint: sweeps until nothing moves, then signals waiters.
    /// Returns how many messages were drained.
    pub fn run(&self) -> usize {
        let mut total = 0;
        {
            let state = self.state.read();
            loop {
                let mut moved = 0;
                for node in &state.nodes {
                    for msg in node.outbox().drain() {
                        moved += 1;
                        self.deliver(&state, node, msg);
                    }
                }
                if moved == 0 {
                    break;
                }
                total += moved;
            }
        }

        let mut generation = self.generation.lock();
        *generation += 1;
        self.pass_done.notify_all();
        total
    }

    fn deliver(&self, state: &RouterState, from: &Mailbox, msg: crate::message::Message) {
        let targets: Vec<&Arc<Mailbox>> = state
            .routes
            .get(&msg.tag)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| state.by_name.get(n).map(|i| &state.nodes[*i]))
                    .collect()
            })
            .unwrap_or_default();

        let Some((last, rest)) = targets.split_last() else {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            warn_throttled!(
                Duration::from_secs(10),
                "[Router] no subscriber for tag `{}` from {}",
                msg.tag,
                from.name()
            );
            return;
        };
        for target in rest {
            target.inbox().push(msg.clone());
        }
        last.inbox().push(msg);
        self.delivered
            .fetch_add(targets.len() as u64, Ordering::Relaxed);
    }

    /// Blocks until at least `target` passes have completed. Returns false on
    /// timeout.
    pub fn wait_for_generation(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation < target {
            if self.pass_done.wait_until(&mut generation, deadline).timed_out() {
                return *generation >= target;
            }
        }
        true
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        let mut d = f.debug_struct("MessageRouter");
        for kind in BUCKETS {
            d.field(kind.as_str(), &state.buckets[bucket_pos(kind)].len());
        }
        d.field("routes", &state.routes.len())
            .field("iterations", &*self.generation.lock())
            .finish()
    }
}
