//! Node rendering and GPU resource ownership.
//!
//! `NodeRenderer` maps node ids to their cached output textures and lazily
//! built painter instances. Evaluation order is the scheduler's problem;
//! this layer renders one node at a time against the mirrored graph.

pub mod gpu;
pub mod painters;
pub mod wgsl;

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use anyhow::{Context as _, Result, anyhow, bail};

use crate::blueprint::resolve_params;
use crate::graph::{FilterMode, GraphSnapshot, NodeId};

use gpu::GpuContext;
use painters::{InputBinding, PaintContext, Painter, create_painter};

/// One rendered output socket.
pub struct OutputTexture {
    pub socket: String,
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub size: u32,
    pub filter: FilterMode,
}

/// What the cache holds for a node: its own textures, or a pointer at the
/// node whose textures it forwards (output/sink nodes never own pixels).
pub enum CachedOutput {
    Owned(Vec<OutputTexture>),
    Aliased(NodeId),
}

#[derive(Default)]
struct NodeResources {
    painter: Option<Box<dyn Painter>>,
    output: Option<CachedOutput>,
}

#[derive(Default)]
pub struct NodeRenderer {
    nodes: HashMap<NodeId, NodeResources>,
}

impl NodeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached textures and painter for one node.
    pub fn invalidate(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// The node's rendered outputs, following alias links. `None` when the
    /// node (or whatever it aliases) has not rendered yet.
    pub fn fetch(&self, id: NodeId) -> Option<&[OutputTexture]> {
        self.resolve_owned(id).map(|(_, outputs)| outputs.as_slice())
    }

    fn resolve_owned(&self, id: NodeId) -> Option<(NodeId, &Vec<OutputTexture>)> {
        let mut visited = HashSet::new();
        let mut current = id;
        loop {
            if !visited.insert(current) {
                return None;
            }
            match self.nodes.get(&current)?.output.as_ref()? {
                CachedOutput::Owned(outputs) => return Some((current, outputs)),
                CachedOutput::Aliased(target) => current = *target,
            }
        }
    }

    /// Evaluate one node into its cached textures.
    ///
    /// Sink nodes only update their alias link. Failures (unknown painter
    /// kind included) are per-node errors; callers log and move on.
    pub fn render(&mut self, gpu: &GpuContext, snapshot: &GraphSnapshot, id: NodeId) -> Result<()> {
        let entry = snapshot
            .node(id)
            .ok_or_else(|| anyhow!("render requested for unknown node {id}"))?;
        let blueprint = entry.blueprint.clone();

        if blueprint.sink {
            let alias = blueprint
                .primary_input()
                .and_then(|socket| snapshot.input_source(id, socket))
                .map(|source| source.node());
            let resources = self.nodes.entry(id).or_default();
            resources.output = alias.map(CachedOutput::Aliased);
            return Ok(());
        }

        let size = entry.node.texture_size.max(1);
        let filter = entry.node.filter;
        self.ensure_owned_textures(gpu, id, &blueprint.outputs, size, filter);

        // The painter box is taken out of the map so input views can be
        // borrowed from other cache entries while it runs.
        let mut painter = match self.nodes.entry(id).or_default().painter.take() {
            Some(painter) => painter,
            None => create_painter(gpu, blueprint.clone())
                .with_context(|| format!("building painter for node {id} ({})", blueprint.name))?,
        };

        let result = self.paint_node(gpu, snapshot, id, &mut painter, size);
        self.nodes.entry(id).or_default().painter = Some(painter);
        result
    }

    fn paint_node(
        &self,
        gpu: &GpuContext,
        snapshot: &GraphSnapshot,
        id: NodeId,
        painter: &mut Box<dyn Painter>,
        size: u32,
    ) -> Result<()> {
        let entry = snapshot.node(id).expect("checked by render");
        let params = resolve_params(&entry.blueprint, &entry.node.params);

        let inputs: Vec<Option<InputBinding<'_>>> = entry
            .blueprint
            .inputs
            .iter()
            .map(|socket| {
                let source = snapshot.input_source(id, socket)?;
                let (_, outputs) = self.resolve_owned(source.node())?;
                outputs
                    .iter()
                    .find(|o| o.socket.as_str() == source.socket())
                    .map(|o| InputBinding {
                        view: &o.view,
                        filter: o.filter,
                    })
            })
            .collect();

        let Some(CachedOutput::Owned(owned)) =
            self.nodes.get(&id).and_then(|r| r.output.as_ref())
        else {
            bail!("output textures missing for node {id}");
        };
        let targets: Vec<wgpu::TextureView> = owned
            .iter()
            .map(|o| o.texture.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();

        let ctx = PaintContext {
            gpu,
            node: &entry.node,
            params: &params,
            inputs: &inputs,
            targets: &targets,
            size,
        };
        painter.paint(&ctx)
    }

    fn ensure_owned_textures(
        &mut self,
        gpu: &GpuContext,
        id: NodeId,
        sockets: &[String],
        size: u32,
        filter: FilterMode,
    ) {
        let resources = self.nodes.entry(id).or_default();
        let reusable = matches!(
            resources.output.as_ref(),
            Some(CachedOutput::Owned(outputs))
                if outputs.len() == sockets.len()
                    && outputs.iter().zip(sockets).all(|(o, s)|
                        o.size == size && o.filter == filter && o.socket == *s)
        );
        if reusable {
            return;
        }
        let outputs = sockets
            .iter()
            .map(|socket| {
                let texture =
                    gpu.create_target_texture(&format!("matforge.node.{id}.{socket}"), size, size);
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                OutputTexture {
                    socket: socket.clone(),
                    texture,
                    view,
                    size,
                    filter,
                }
            })
            .collect();
        resources.output = Some(CachedOutput::Owned(outputs));
    }

    /// Extract a node's first output as tightly packed RGBA8 pixels.
    ///
    /// Renders lazily when nothing is cached, but never re-renders a cached
    /// result. A size or filter override goes through a blit into a
    /// temporary target before readback.
    pub fn render_to_image(
        &mut self,
        gpu: &GpuContext,
        snapshot: &GraphSnapshot,
        id: NodeId,
        width: Option<u32>,
        height: Option<u32>,
        filter: Option<FilterMode>,
    ) -> Result<(u32, u32, Vec<u8>)> {
        if self.resolve_owned(id).is_none() {
            self.render(gpu, snapshot, id)?;
        }
        let (_, outputs) = self
            .resolve_owned(id)
            .ok_or_else(|| anyhow!("node {id} has no rendered output"))?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("node {id} declares no output sockets"))?;

        let out_w = width.unwrap_or(output.size).max(1);
        let out_h = height.unwrap_or(output.size).max(1);
        if out_w == output.size && out_h == output.size {
            let pixels = gpu.read_texture_rgba8(&output.texture, out_w, out_h)?;
            return Ok((out_w, out_h, pixels));
        }

        let scaled = gpu.create_target_texture("matforge.readback.scaled", out_w, out_h);
        gpu.blit(&output.view, &scaled, filter.unwrap_or(output.filter))?;
        let pixels = gpu.read_texture_rgba8(&scaled, out_w, out_h)?;
        Ok((out_w, out_h, pixels))
    }
}

/// PNG-encode a tightly packed RGBA8 buffer (file export paths).
pub fn encode_png(width: u32, height: u32, pixels: &[u8]) -> Result<Vec<u8>> {
    let image = image::RgbaImage::from_raw(width, height, pixels.to_vec())
        .ok_or_else(|| anyhow!("pixel buffer does not match {width}x{height} RGBA8"))?;
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(bytes)
}
