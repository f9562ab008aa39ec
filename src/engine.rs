//! The render-side engine: a mirrored graph snapshot, the scheduler, and
//! the resource cache, driven entirely by protocol messages and frame ticks.
//!
//! Node state machine (render side's view): Unknown → Present → Removed.
//! A full snapshot inserts or replaces; a minimal snapshot classifies into
//! one of the invalidation paths below; `null` removes. Messages naming an
//! id the mirror does not know are a protocol bug: logged, ignored.

use anyhow::{Result, anyhow};
use std::sync::Arc;

use crate::graph::{GraphSnapshot, NodeId};
use crate::protocol::{
    EngineCommand, EngineResponse, InitializePayload, MinimalNodeSnapshot, NodeSyncSnapshot,
    PixelBufferPayload, RenderNodePayload, SynchronizeEdgesPayload, SynchronizeNodePayload,
    UiTransformPayload, ViewportSizePayload,
};
use crate::renderer::NodeRenderer;
use crate::renderer::gpu::GpuContext;
use crate::scheduler::Scheduler;

/// Seam for the preview compositors (node thumbnails, viewport overlay).
/// The engine tells the hook when the overlay must recomposite; what that
/// means visually is not this crate's business.
pub trait CompositorHook {
    fn recomposite(&mut self, _snapshot: &GraphSnapshot) {}
    fn viewport_resized(&mut self, _width: u32, _height: u32) {}
    fn transform_changed(&mut self, _x: f32, _y: f32, _scale: f32) {}
}

/// Default hook that does nothing.
pub struct NullCompositor;
impl CompositorHook for NullCompositor {}

/// Classification of one `synchronize_node` message against the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// Full snapshot: insert or replace, then chain-schedule.
    InsertOrReplace,
    /// Position only: move the overlay, render nothing.
    RecompositeOverlay,
    /// Size or filter changed: the cached texture object itself is stale.
    InvalidateAndScheduleOutputs,
    /// Some other parameter changed; cached inputs stay valid.
    ScheduleOutputs,
    Remove,
    /// Minimal snapshot with nothing in it.
    NoChange,
    /// Unknown node id: desync, ignore the message.
    Desync,
}

/// Pure classification, separated from the mutation so it can be tested
/// against the mirror without a GPU.
pub fn plan_node_sync(
    snapshot: &GraphSnapshot,
    node_id: NodeId,
    sync: Option<&NodeSyncSnapshot>,
) -> SyncPlan {
    match sync {
        Some(NodeSyncSnapshot::Full(_)) => SyncPlan::InsertOrReplace,
        None => {
            if snapshot.contains(node_id) {
                SyncPlan::Remove
            } else {
                SyncPlan::Desync
            }
        }
        Some(NodeSyncSnapshot::Minimal(minimal)) => {
            let Some(entry) = snapshot.node(node_id) else {
                return SyncPlan::Desync;
            };
            let size_changed = minimal
                .texture_size
                .is_some_and(|s| s != entry.node.texture_size);
            let filter_changed = minimal.filter.is_some_and(|f| f != entry.node.filter);
            if size_changed || filter_changed {
                SyncPlan::InvalidateAndScheduleOutputs
            } else if minimal.params.as_ref().is_some_and(|p| !p.is_empty()) {
                SyncPlan::ScheduleOutputs
            } else if minimal.position.is_some() {
                SyncPlan::RecompositeOverlay
            } else {
                SyncPlan::NoChange
            }
        }
    }
}

pub struct RenderEngine {
    gpu: Option<GpuContext>,
    snapshot: GraphSnapshot,
    scheduler: Scheduler,
    renderer: NodeRenderer,
    compositor: Box<dyn CompositorHook>,
    viewport: (u32, u32),
}

impl RenderEngine {
    /// `gpu = None` keeps the mirror and scheduler alive but makes every
    /// rendering command answer `GPU_UNAVAILABLE`.
    pub fn new(gpu: Option<GpuContext>) -> Self {
        Self::with_compositor(gpu, Box::new(NullCompositor))
    }

    pub fn with_compositor(gpu: Option<GpuContext>, compositor: Box<dyn CompositorHook>) -> Self {
        Self {
            gpu,
            snapshot: GraphSnapshot::new(),
            scheduler: Scheduler::new(),
            renderer: NodeRenderer::new(),
            compositor,
            viewport: (0, 0),
        }
    }

    pub fn snapshot(&self) -> &GraphSnapshot {
        &self.snapshot
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Last viewport size reported by the authoring side.
    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    /// Apply one protocol command. `Some(response)` must reach the sender;
    /// `None` is a fire-and-forget command. A returned `Err` is a command
    /// that expected a response and failed; the transport wraps it.
    pub fn handle_command(&mut self, command: EngineCommand) -> Result<Option<EngineResponse>> {
        match command {
            EngineCommand::Initialize(payload) => self.initialize(payload).map(Some),
            EngineCommand::SynchronizeNode(payload) => {
                self.synchronize_node(payload)?;
                Ok(None)
            }
            EngineCommand::SynchronizeEdges(payload) => {
                self.synchronize_edges(payload)?;
                Ok(None)
            }
            EngineCommand::RenderNode(payload) => self.render_node(payload).map(Some),
            EngineCommand::SetViewportSize(payload) => {
                self.set_viewport_size(payload);
                Ok(None)
            }
            EngineCommand::SetUiTransform(payload) => {
                self.set_ui_transform(payload);
                Ok(None)
            }
        }
    }

    fn initialize(&mut self, payload: InitializePayload) -> Result<EngineResponse> {
        if self.gpu.is_none() {
            return Ok(EngineResponse::error(
                "GPU_UNAVAILABLE",
                "no GPU device; the render side cannot start",
            ));
        }
        self.snapshot = payload.material.into_snapshot();
        self.renderer.clear();
        self.scheduler = Scheduler::new();
        log::info!(
            "[engine] initialized with {} nodes, {} edges",
            self.snapshot.node_count(),
            self.snapshot.edges().len()
        );
        if payload.start {
            for id in self.snapshot.node_ids() {
                self.scheduler.schedule_chain(&self.snapshot, id)?;
            }
        }
        Ok(EngineResponse::Initialized)
    }

    fn synchronize_node(&mut self, payload: SynchronizeNodePayload) -> Result<()> {
        let id = payload.node_id;
        match plan_node_sync(&self.snapshot, id, payload.node_snapshot.as_ref()) {
            SyncPlan::Desync => {
                log::error!("[sync] message for unknown node {id}; mirror is desynchronized");
                Ok(())
            }
            SyncPlan::NoChange => Ok(()),
            SyncPlan::InsertOrReplace => {
                let Some(NodeSyncSnapshot::Full(full)) = payload.node_snapshot else {
                    unreachable!("classified as full snapshot");
                };
                if full.node.id != id {
                    log::warn!(
                        "[sync] full snapshot for node {id} carries id {}; using the payload node",
                        full.node.id
                    );
                }
                self.renderer.invalidate(full.node.id);
                let new_id = full.node.id;
                self.snapshot.insert_node(full.node, Arc::new(full.blueprint));
                // A new or replaced node has nothing known-valid about it.
                self.scheduler.schedule_chain(&self.snapshot, new_id)
            }
            SyncPlan::Remove => {
                self.renderer.invalidate(id);
                // Downstream nodes re-render against the placeholder, so
                // schedule them while the old edges still exist.
                self.scheduler.schedule_outputs(&self.snapshot, id, true)?;
                self.snapshot.remove_node(id);
                Ok(())
            }
            SyncPlan::InvalidateAndScheduleOutputs => {
                self.apply_minimal(id, payload.node_snapshot);
                self.renderer.invalidate(id);
                self.scheduler.schedule_outputs(&self.snapshot, id, false)
            }
            SyncPlan::ScheduleOutputs => {
                self.apply_minimal(id, payload.node_snapshot);
                self.scheduler.schedule_outputs(&self.snapshot, id, false)
            }
            SyncPlan::RecompositeOverlay => {
                self.apply_minimal(id, payload.node_snapshot);
                // Thumbnails must move now, not on the next drain.
                self.compositor.recomposite(&self.snapshot);
                Ok(())
            }
        }
    }

    fn apply_minimal(&mut self, id: NodeId, sync: Option<NodeSyncSnapshot>) {
        let Some(NodeSyncSnapshot::Minimal(minimal)) = sync else {
            return;
        };
        let Some(entry) = self.snapshot.node_mut(id) else {
            return;
        };
        let MinimalNodeSnapshot {
            position,
            texture_size,
            filter,
            params,
        } = minimal;
        if let Some(position) = position {
            entry.node.position = position;
        }
        if let Some(size) = texture_size {
            entry.node.texture_size = size;
        }
        if let Some(filter) = filter {
            entry.node.filter = filter;
        }
        if let Some(params) = params {
            entry.node.params.extend(params);
        }
    }

    fn synchronize_edges(&mut self, payload: SynchronizeEdgesPayload) -> Result<()> {
        let id = payload.node_id;
        if !self.snapshot.contains(id) {
            log::error!("[sync] edge update for unknown node {id}; mirror is desynchronized");
            return Ok(());
        }
        // Scheduled both before and after the swap so old and new consumer
        // sets are covered.
        self.scheduler.schedule_outputs(&self.snapshot, id, false)?;
        self.snapshot.replace_edges(payload.edges);
        self.scheduler.schedule_outputs(&self.snapshot, id, false)
    }

    fn render_node(&mut self, payload: RenderNodePayload) -> Result<EngineResponse> {
        let id = payload.node_id;
        let Some(gpu) = self.gpu.as_ref() else {
            return Ok(EngineResponse::error(
                "GPU_UNAVAILABLE",
                "no GPU device; cannot extract an image",
            ));
        };
        if !self.snapshot.contains(id) {
            return Err(anyhow!("render_node for unknown node {id}"));
        }

        // A disposable scheduler renders every ancestor first, then stops:
        // the main pending set is untouched by a one-shot extraction.
        let mut one_shot = Scheduler::new();
        one_shot.schedule_chain(&self.snapshot, id)?;
        let renderer = &mut self.renderer;
        let snapshot = &self.snapshot;
        one_shot.drain(|batch| {
            for &node_id in batch {
                if let Err(e) = renderer.render(gpu, snapshot, node_id) {
                    log::error!("[render] node {node_id} failed: {e:#}");
                }
                if node_id == id {
                    break;
                }
            }
        });

        let (width, height, pixels) = self.renderer.render_to_image(
            gpu,
            &self.snapshot,
            id,
            payload.output_width,
            payload.output_height,
            payload.output_filter,
        )?;
        Ok(EngineResponse::PixelBuffer(PixelBufferPayload::encode(
            width, height, &pixels,
        )))
    }

    fn set_viewport_size(&mut self, payload: ViewportSizePayload) {
        self.viewport = (payload.width, payload.height);
        self.compositor.viewport_resized(payload.width, payload.height);
    }

    fn set_ui_transform(&mut self, payload: UiTransformPayload) {
        self.compositor
            .transform_changed(payload.x, payload.y, payload.scale);
    }

    /// One frame tick: drain the pending set, render each id in order, and
    /// recomposite once if anything rendered. Per-node failures are logged
    /// and never stop the batch.
    pub fn tick(&mut self) {
        let Some(gpu) = self.gpu.as_ref() else {
            return;
        };
        let renderer = &mut self.renderer;
        let snapshot = &self.snapshot;
        let mut rendered = false;
        self.scheduler.drain(|batch| {
            log::debug!("[tick] draining {} node(s): {batch:?}", batch.len());
            for &id in batch {
                if let Err(e) = renderer.render(gpu, snapshot, id) {
                    log::error!("[render] node {id} failed: {e:#}");
                }
            }
            rendered = true;
        });
        if rendered {
            self.compositor.recomposite(&self.snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::load_default_catalog;
    use crate::graph::{FilterMode, Node};
    use crate::protocol::MinimalNodeSnapshot;
    use std::collections::BTreeMap;

    fn minimal(snapshot: MinimalNodeSnapshot) -> Option<NodeSyncSnapshot> {
        Some(NodeSyncSnapshot::Minimal(snapshot))
    }

    fn seeded_snapshot() -> GraphSnapshot {
        let catalog = load_default_catalog().unwrap();
        let mut snap = GraphSnapshot::new();
        snap.insert_node(
            Node {
                id: 1,
                blueprint: "solid-color".to_string(),
                params: BTreeMap::new(),
                texture_size: 512,
                filter: FilterMode::Linear,
                position: [0.0, 0.0],
            },
            catalog.get("solid-color").unwrap().clone(),
        );
        snap
    }

    #[test]
    fn position_only_update_recomposites_without_scheduling() {
        let snap = seeded_snapshot();
        let plan = plan_node_sync(
            &snap,
            1,
            minimal(MinimalNodeSnapshot {
                position: Some([4.0, 2.0]),
                ..Default::default()
            })
            .as_ref(),
        );
        assert_eq!(plan, SyncPlan::RecompositeOverlay);
    }

    #[test]
    fn size_change_invalidates_cache() {
        let snap = seeded_snapshot();
        let plan = plan_node_sync(
            &snap,
            1,
            minimal(MinimalNodeSnapshot {
                texture_size: Some(1024),
                ..Default::default()
            })
            .as_ref(),
        );
        assert_eq!(plan, SyncPlan::InvalidateAndScheduleOutputs);
    }

    #[test]
    fn same_size_with_params_is_a_plain_output_schedule() {
        let snap = seeded_snapshot();
        let mut params = BTreeMap::new();
        params.insert(
            "color".to_string(),
            crate::value::ParamValue::Vec4([1.0, 0.0, 0.0, 1.0]),
        );
        let plan = plan_node_sync(
            &snap,
            1,
            minimal(MinimalNodeSnapshot {
                texture_size: Some(512),
                params: Some(params),
                ..Default::default()
            })
            .as_ref(),
        );
        assert_eq!(plan, SyncPlan::ScheduleOutputs);
    }

    #[test]
    fn unknown_node_is_a_desync() {
        let snap = seeded_snapshot();
        assert_eq!(plan_node_sync(&snap, 99, None), SyncPlan::Desync);
        assert_eq!(
            plan_node_sync(
                &snap,
                99,
                minimal(MinimalNodeSnapshot::default()).as_ref()
            ),
            SyncPlan::Desync
        );
    }

    #[test]
    fn removal_of_present_node_classifies_as_remove() {
        let snap = seeded_snapshot();
        assert_eq!(plan_node_sync(&snap, 1, None), SyncPlan::Remove);
    }

    #[test]
    fn full_snapshot_always_replaces() {
        let snap = seeded_snapshot();
        let catalog = load_default_catalog().unwrap();
        let full = NodeSyncSnapshot::Full(crate::protocol::FullNodeSnapshot {
            node: Node {
                id: 7,
                blueprint: "checker".to_string(),
                params: BTreeMap::new(),
                texture_size: 256,
                filter: FilterMode::Nearest,
                position: [0.0, 0.0],
            },
            blueprint: (*catalog.get("checker").unwrap().clone()).clone(),
            inputs: Default::default(),
            outputs: Default::default(),
        });
        assert_eq!(plan_node_sync(&snap, 7, Some(&full)), SyncPlan::InsertOrReplace);
    }
}
