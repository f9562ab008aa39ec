//! Dependency scheduler: batches dirty node ids between frame ticks.
//!
//! Many edits between two ticks collapse into one render per affected node.
//! The pending state is an insertion-ordered list plus a membership set: the
//! set guards call entry (scheduling an already-pending id is a no-op), a
//! per-call visited set prunes diamond re-visits, and the drained list keeps
//! the exact order the traversals enqueued ids in, including repeats from
//! separate scheduling calls, which a render pass absorbs idempotently.
//!
//! Traversals recurse over the mirror's live edge list. A cyclic edge list
//! would recurse forever under a pure pending-set guard, so every traversal
//! entry point first runs the mirror's Kahn check and fails fast instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use crate::graph::{GraphSnapshot, NodeId};

#[derive(Debug, Default)]
pub struct Scheduler {
    order: Vec<NodeId>,
    pending: HashSet<NodeId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_pending(&self, id: NodeId) -> bool {
        self.pending.contains(&id)
    }

    /// Add `id` to the pending set. No side effect if already present.
    pub fn schedule(&mut self, id: NodeId) {
        if self.pending.insert(id) {
            self.order.push(id);
        }
    }

    /// Record one traversal visit: appends to the drain order unconditionally
    /// so overlapping traversals from separate calls keep their own order.
    fn enqueue(&mut self, id: NodeId) {
        self.order.push(id);
        self.pending.insert(id);
    }

    /// Schedule `id` together with all transitive producers (before it) and
    /// all transitive consumers (after it). No-op when `id` is already
    /// pending. Fails fast on a cyclic edge list.
    pub fn schedule_chain(&mut self, snapshot: &GraphSnapshot, id: NodeId) -> Result<()> {
        if self.pending.contains(&id) {
            return Ok(());
        }
        snapshot.check_acyclic()?;
        let mut visited = HashSet::new();
        let mut enqueued = HashSet::new();
        self.chain_visit(snapshot, id, &mut visited, &mut enqueued);
        Ok(())
    }

    /// Walk the connected component along both producer and consumer edges.
    /// `visited` bounds the walk; emission order is `emit_after_producers`'s
    /// problem, since a shortcut edge can reach a consumer while one of its
    /// producers is still mid-visit on the stack.
    fn chain_visit(
        &mut self,
        snapshot: &GraphSnapshot,
        id: NodeId,
        visited: &mut HashSet<NodeId>,
        enqueued: &mut HashSet<NodeId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        for producer in snapshot.producers(id) {
            self.chain_visit(snapshot, producer, visited, enqueued);
        }
        self.emit_after_producers(snapshot, id, enqueued);
        for consumer in snapshot.consumers(id) {
            self.chain_visit(snapshot, consumer, visited, enqueued);
        }
    }

    /// Enqueue `id`, first emitting any transitive producer this call has
    /// not emitted yet, so inputs are valid by the time the node renders.
    fn emit_after_producers(
        &mut self,
        snapshot: &GraphSnapshot,
        id: NodeId,
        enqueued: &mut HashSet<NodeId>,
    ) {
        if !enqueued.insert(id) {
            return;
        }
        for producer in snapshot.producers(id) {
            self.emit_after_producers(snapshot, producer, enqueued);
        }
        self.enqueue(id);
    }

    /// Schedule `id` (unless `skip_self`) and all transitive consumers.
    /// Producers are never touched; this is the parameter-edit path.
    /// No-op when `id` is already pending.
    pub fn schedule_outputs(
        &mut self,
        snapshot: &GraphSnapshot,
        id: NodeId,
        skip_self: bool,
    ) -> Result<()> {
        if self.pending.contains(&id) {
            return Ok(());
        }
        snapshot.check_acyclic()?;
        let mut visited = HashSet::new();
        visited.insert(id);
        if !skip_self {
            self.enqueue(id);
        }
        for consumer in snapshot.consumers(id) {
            self.outputs_visit(snapshot, consumer, &mut visited);
        }
        Ok(())
    }

    fn outputs_visit(
        &mut self,
        snapshot: &GraphSnapshot,
        id: NodeId,
        visited: &mut HashSet<NodeId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        self.enqueue(id);
        for consumer in snapshot.consumers(id) {
            self.outputs_visit(snapshot, consumer, visited);
        }
    }

    /// Invoke `callback` once with the insertion-ordered pending list, then
    /// clear. Does not invoke the callback when nothing is pending.
    pub fn drain(&mut self, callback: impl FnOnce(&[NodeId])) {
        if self.order.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.order);
        self.pending.clear();
        callback(&batch);
    }

    /// Full-graph warm-up followed by a frame-clock drain loop.
    ///
    /// Chains every node once (so the first frame renders the whole graph),
    /// then drains on each tick until `stop` is raised. The engine binary
    /// integrates draining into its own select loop instead; this entry
    /// point serves embedders that drive the scheduler directly.
    pub fn run(
        &mut self,
        snapshot: &GraphSnapshot,
        frame_interval: Duration,
        stop: Arc<AtomicBool>,
        mut callback: impl FnMut(&[NodeId]),
    ) -> Result<()> {
        for id in snapshot.node_ids() {
            self.schedule_chain(snapshot, id)?;
        }
        let ticks = crossbeam_channel::tick(frame_interval);
        while !stop.load(Ordering::Relaxed) {
            if ticks.recv().is_err() {
                break;
            }
            self.drain(&mut callback);
        }
        Ok(())
    }
}
