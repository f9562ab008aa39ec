//! Painter strategies: interchangeable per-node rendering backends.
//!
//! A painter is constructed lazily from a node's blueprint the first time the
//! node renders and lives in the resource cache until the node is
//! invalidated. Painters never own output textures; they draw into the
//! targets handed to them.

mod instanced;
mod single_pass;
mod two_pass;

pub use instanced::{InstancedPainter, MAX_INSTANCES};
pub use single_pass::SinglePassPainter;
pub use two_pass::TwoPassPainter;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};

use crate::blueprint::{
    Blueprint, PAINTER_PATTERN, PAINTER_SINGLE_PASS, PAINTER_TWO_PASS,
};
use crate::graph::{FilterMode, Node};
use crate::renderer::gpu::GpuContext;
use crate::renderer::wgsl::{PARAM_SLOTS, slot_params};
use crate::value::ParamValue;

/// A resolved input: the producing node's texture view plus the filter that
/// node declared for its output.
#[derive(Clone, Copy)]
pub struct InputBinding<'a> {
    pub view: &'a wgpu::TextureView,
    pub filter: FilterMode,
}

/// Everything a painter needs for one evaluation of one node.
pub struct PaintContext<'a> {
    pub gpu: &'a GpuContext,
    pub node: &'a Node,
    /// Resolved parameter bag: defaults merged, kinds validated.
    pub params: &'a BTreeMap<String, ParamValue>,
    /// One entry per declared input socket; `None` when unconnected.
    pub inputs: &'a [Option<InputBinding<'a>>],
    /// One view per declared output socket.
    pub targets: &'a [wgpu::TextureView],
    /// Square target resolution in texels.
    pub size: u32,
}

pub trait Painter {
    fn paint(&mut self, ctx: &PaintContext<'_>) -> Result<()>;
}

/// Build the painter for a blueprint's declared painter kind. An unknown
/// kind is an error the caller logs and contains per node.
pub fn create_painter(gpu: &GpuContext, blueprint: Arc<Blueprint>) -> Result<Box<dyn Painter>> {
    match blueprint.painter.as_str() {
        PAINTER_SINGLE_PASS => Ok(Box::new(SinglePassPainter::new(gpu, blueprint)?)),
        PAINTER_TWO_PASS => Ok(Box::new(TwoPassPainter::new(gpu, blueprint)?)),
        PAINTER_PATTERN => Ok(Box::new(InstancedPainter::new(gpu, blueprint)?)),
        other => bail!("unknown painter kind: {other}"),
    }
}

/// Pack resolved parameter values into vec4 uniform slots, in the schema's
/// declaration order. Kinds without a vec4 packing are logged and leave
/// their slot zeroed.
pub fn pack_params(
    blueprint: &Blueprint,
    params: &BTreeMap<String, ParamValue>,
) -> [[f32; 4]; PARAM_SLOTS] {
    let mut slots = [[0.0f32; 4]; PARAM_SLOTS];
    for (i, spec) in slot_params(blueprint).into_iter().enumerate() {
        let Some(value) = params.get(&spec.name) else {
            continue;
        };
        match value.to_uniform_slot() {
            Some(slot) => slots[i] = slot,
            None => log::warn!(
                "blueprint '{}': param '{}' has no uniform packing; slot left zeroed",
                blueprint.name,
                spec.name
            ),
        }
    }
    slots
}

/// Pass metadata delivered alongside the parameter slots.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct PassMeta {
    pub resolution: [f32; 2],
    pub pass_index: u32,
    pub _pad: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{load_default_catalog, resolve_params};

    #[test]
    fn pack_params_follows_schema_order() {
        let catalog = load_default_catalog().unwrap();
        let checker = catalog.get("checker").unwrap();
        let mut params = BTreeMap::new();
        params.insert("count".to_string(), ParamValue::Vec2([8.0, 2.0]));
        let resolved = resolve_params(checker, &params);
        let slots = pack_params(checker, &resolved);
        // Slot 0 is count, slots 1/2 the default colors.
        assert_eq!(slots[0], [8.0, 2.0, 0.0, 0.0]);
        assert_eq!(slots[1], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(slots[2], [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn text_params_never_touch_a_slot() {
        let catalog = load_default_catalog().unwrap();
        let levels = catalog.get("levels").unwrap();
        let mut params = BTreeMap::new();
        params.insert("label".to_string(), ParamValue::Text("hello".to_string()));
        params.insert("gamma".to_string(), ParamValue::Scalar(2.2));
        let resolved = resolve_params(levels, &params);
        let slots = pack_params(levels, &resolved);
        // inRange, outRange, gamma occupy slots 0..3; nothing else is written.
        assert_eq!(slots[2][0], 2.2);
        assert_eq!(slots[3], [0.0; 4]);
    }
}
