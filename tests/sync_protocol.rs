//! Protocol-level tests for the graph mirror: full/minimal/removal node
//! sync, edge swaps, and desync handling. These run without a GPU; the
//! engine's mirror and scheduler are fully exercised by sync traffic alone.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use matforge_render_engine::blueprint::load_default_catalog;
use matforge_render_engine::engine::{CompositorHook, RenderEngine};
use matforge_render_engine::graph::{Edge, FilterMode, GraphSnapshot, Node, NodeId, SocketRef};
use matforge_render_engine::protocol::{
    EngineCommand, EngineResponse, FullNodeSnapshot, InitializePayload, MinimalNodeSnapshot,
    NodeSyncSnapshot, RenderNodePayload, SynchronizeEdgesPayload, SynchronizeNodePayload,
    WireGraph,
};
use matforge_render_engine::value::ParamValue;

#[derive(Default)]
struct SpyCompositor {
    recomposites: Rc<Cell<u32>>,
    viewport: Rc<Cell<(u32, u32)>>,
}

impl CompositorHook for SpyCompositor {
    fn recomposite(&mut self, _snapshot: &GraphSnapshot) {
        self.recomposites.set(self.recomposites.get() + 1);
    }

    fn viewport_resized(&mut self, width: u32, height: u32) {
        self.viewport.set((width, height));
    }
}

fn full_sync(id: NodeId, blueprint: &str) -> EngineCommand {
    let catalog = load_default_catalog().unwrap();
    EngineCommand::SynchronizeNode(SynchronizeNodePayload {
        node_id: id,
        node_snapshot: Some(NodeSyncSnapshot::Full(FullNodeSnapshot {
            node: Node {
                id,
                blueprint: blueprint.to_string(),
                params: BTreeMap::new(),
                texture_size: 512,
                filter: FilterMode::Linear,
                position: [0.0, 0.0],
            },
            blueprint: (**catalog.get(blueprint).unwrap()).clone(),
            inputs: Default::default(),
            outputs: Default::default(),
        })),
    })
}

fn minimal_sync(id: NodeId, snapshot: MinimalNodeSnapshot) -> EngineCommand {
    EngineCommand::SynchronizeNode(SynchronizeNodePayload {
        node_id: id,
        node_snapshot: Some(NodeSyncSnapshot::Minimal(snapshot)),
    })
}

fn removal_sync(id: NodeId) -> EngineCommand {
    EngineCommand::SynchronizeNode(SynchronizeNodePayload {
        node_id: id,
        node_snapshot: None,
    })
}

fn edges_sync(id: NodeId, pairs: &[(NodeId, NodeId)]) -> EngineCommand {
    EngineCommand::SynchronizeEdges(SynchronizeEdgesPayload {
        node_id: id,
        edges: pairs
            .iter()
            .map(|(a, b)| Edge {
                from: SocketRef::new(*a, "color"),
                to: SocketRef::new(*b, "in"),
            })
            .collect(),
    })
}

fn drained(engine: &mut RenderEngine) -> Vec<NodeId> {
    let mut out = Vec::new();
    engine.scheduler_mut().drain(|batch| out = batch.to_vec());
    out
}

/// Engine with nodes 0, 1, 2 mirrored, edges `0 -> 1, 0 -> 2`, pending set
/// drained.
fn seeded_engine() -> RenderEngine {
    let mut engine = RenderEngine::new(None);
    for id in 0..3 {
        engine.handle_command(full_sync(id, "levels")).unwrap();
    }
    engine
        .handle_command(edges_sync(0, &[(0, 1), (0, 2)]))
        .unwrap();
    drained(&mut engine);
    engine
}

#[test]
fn full_snapshot_inserts_and_chain_schedules() {
    let mut engine = RenderEngine::new(None);
    let response = engine.handle_command(full_sync(5, "solid-color")).unwrap();
    assert!(response.is_none());
    assert!(engine.snapshot().contains(5));
    assert_eq!(drained(&mut engine), vec![5]);
}

#[test]
fn full_snapshot_replaces_an_existing_node() {
    let mut engine = seeded_engine();
    engine.handle_command(full_sync(1, "checker")).unwrap();
    let entry = engine.snapshot().node(1).unwrap();
    assert_eq!(entry.node.blueprint, "checker");
    // Replacement re-chains the node: its producer and consumers re-render.
    let batch = drained(&mut engine);
    assert!(batch.contains(&0));
    assert!(batch.contains(&1));
}

#[test]
fn removal_schedules_consumers_before_dropping_edges() {
    let mut engine = seeded_engine();
    engine.handle_command(removal_sync(0)).unwrap();
    // Downstream nodes are scheduled from the pre-removal edge list; the
    // removed node itself is not.
    assert_eq!(drained(&mut engine), vec![1, 2]);
    assert!(!engine.snapshot().contains(0));
    assert!(engine.snapshot().edges().is_empty());
}

#[test]
fn position_only_update_recomposites_immediately_and_renders_nothing() {
    let recomposites = Rc::new(Cell::new(0));
    let spy = SpyCompositor {
        recomposites: recomposites.clone(),
        ..Default::default()
    };
    let mut engine = RenderEngine::with_compositor(None, Box::new(spy));
    engine.handle_command(full_sync(1, "solid-color")).unwrap();
    drained(&mut engine);

    engine
        .handle_command(minimal_sync(
            1,
            MinimalNodeSnapshot {
                position: Some([10.0, -4.0]),
                ..Default::default()
            },
        ))
        .unwrap();

    assert_eq!(recomposites.get(), 1);
    assert_eq!(drained(&mut engine), Vec::<NodeId>::new());
    assert_eq!(engine.snapshot().node(1).unwrap().node.position, [10.0, -4.0]);
}

#[test]
fn size_change_applies_and_schedules_outputs() {
    let mut engine = seeded_engine();
    engine
        .handle_command(minimal_sync(
            0,
            MinimalNodeSnapshot {
                texture_size: Some(1024),
                ..Default::default()
            },
        ))
        .unwrap();
    assert_eq!(engine.snapshot().node(0).unwrap().node.texture_size, 1024);
    assert_eq!(drained(&mut engine), vec![0, 1, 2]);
}

#[test]
fn unchanged_size_is_not_an_invalidation() {
    let mut engine = seeded_engine();
    // 512 is already the mirrored value; nothing to do.
    engine
        .handle_command(minimal_sync(
            1,
            MinimalNodeSnapshot {
                texture_size: Some(512),
                ..Default::default()
            },
        ))
        .unwrap();
    assert_eq!(drained(&mut engine), Vec::<NodeId>::new());
}

#[test]
fn param_update_merges_and_schedules_node_with_consumers() {
    let mut engine = seeded_engine();
    let mut params = BTreeMap::new();
    params.insert("gamma".to_string(), ParamValue::Scalar(2.2));
    engine
        .handle_command(minimal_sync(
            0,
            MinimalNodeSnapshot {
                params: Some(params),
                ..Default::default()
            },
        ))
        .unwrap();
    assert_eq!(
        engine.snapshot().node(0).unwrap().node.params.get("gamma"),
        Some(&ParamValue::Scalar(2.2))
    );
    assert_eq!(drained(&mut engine), vec![0, 1, 2]);
}

#[test]
fn edge_swap_schedules_the_node_and_its_prior_consumers() {
    let mut engine = seeded_engine();
    engine.handle_command(edges_sync(0, &[(0, 2)])).unwrap();
    // The pre-swap schedule covers node 0 and both old consumers; the
    // post-swap call is absorbed by the pending-set entry guard.
    assert_eq!(drained(&mut engine), vec![0, 1, 2]);
    assert_eq!(engine.snapshot().edges().len(), 1);
    assert_eq!(engine.snapshot().consumers(0), vec![2]);
}

#[test]
fn messages_for_unknown_nodes_are_ignored() {
    let mut engine = seeded_engine();
    engine
        .handle_command(minimal_sync(
            99,
            MinimalNodeSnapshot {
                texture_size: Some(64),
                ..Default::default()
            },
        ))
        .unwrap();
    engine.handle_command(removal_sync(99)).unwrap();
    engine.handle_command(edges_sync(99, &[(0, 1)])).unwrap();
    assert_eq!(engine.snapshot().node_count(), 3);
    assert_eq!(drained(&mut engine), Vec::<NodeId>::new());
}

#[test]
fn initialize_and_render_without_gpu_report_unavailable() {
    let mut engine = RenderEngine::new(None);
    let response = engine
        .handle_command(EngineCommand::Initialize(InitializePayload {
            material: WireGraph::default(),
            start: true,
        }))
        .unwrap();
    match response {
        Some(EngineResponse::Error(e)) => assert_eq!(e.code, "GPU_UNAVAILABLE"),
        other => panic!("expected error response, got {other:?}"),
    }

    engine.handle_command(full_sync(1, "solid-color")).unwrap();
    let response = engine
        .handle_command(EngineCommand::RenderNode(RenderNodePayload {
            node_id: 1,
            output_width: None,
            output_height: None,
            output_filter: None,
        }))
        .unwrap();
    match response {
        Some(EngineResponse::Error(e)) => assert_eq!(e.code, "GPU_UNAVAILABLE"),
        other => panic!("expected error response, got {other:?}"),
    }
}

#[test]
fn viewport_size_reaches_the_compositor() {
    let viewport = Rc::new(Cell::new((0, 0)));
    let spy = SpyCompositor {
        viewport: viewport.clone(),
        ..Default::default()
    };
    let mut engine = RenderEngine::with_compositor(None, Box::new(spy));
    engine
        .handle_command(EngineCommand::SetViewportSize(
            matforge_render_engine::protocol::ViewportSizePayload {
                width: 1920,
                height: 1080,
            },
        ))
        .unwrap();
    assert_eq!(viewport.get(), (1920, 1080));
    assert_eq!(engine.viewport(), (1920, 1080));
}
