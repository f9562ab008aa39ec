//! Two-pass shader painter: separable filters that run the same generated
//! shader twice. Pass 0 renders the node's inputs into an intermediate
//! texture; pass 1 consumes the intermediate through the primary input
//! binding and writes the real attachment. The shader switches behavior on
//! `pass_meta.pass_index`.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::blueprint::Blueprint;
use crate::graph::FilterMode;
use crate::renderer::gpu::GpuContext;

use super::single_pass::{META_BUFFER_SIZE, PARAMS_BUFFER_SIZE, ShaderCore};
use super::{InputBinding, PaintContext, Painter, PassMeta, pack_params};

pub struct TwoPassPainter {
    core: ShaderCore,
    params_buf: wgpu::Buffer,
    meta_bufs: [wgpu::Buffer; 2],
    uniforms_groups: [wgpu::BindGroup; 2],
    /// Intermediate square target, rebuilt when the node size changes.
    intermediate: Option<(u32, wgpu::TextureView)>,
}

impl TwoPassPainter {
    pub fn new(gpu: &GpuContext, blueprint: Arc<Blueprint>) -> Result<Self> {
        if blueprint.outputs.len() != 1 {
            bail!(
                "two-pass blueprint '{}' must declare exactly one output",
                blueprint.name
            );
        }
        if blueprint.primary_input().is_none() {
            bail!(
                "two-pass blueprint '{}' must declare an input socket",
                blueprint.name
            );
        }
        let core = ShaderCore::new(gpu, blueprint)?;
        let params_buf = core.create_uniform_buffer(gpu, "matforge.params", PARAMS_BUFFER_SIZE);
        let meta_bufs = [
            core.create_uniform_buffer(gpu, "matforge.meta.pass0", META_BUFFER_SIZE),
            core.create_uniform_buffer(gpu, "matforge.meta.pass1", META_BUFFER_SIZE),
        ];
        let uniforms_groups = [
            core.create_uniforms_group(gpu, &params_buf, &meta_bufs[0]),
            core.create_uniforms_group(gpu, &params_buf, &meta_bufs[1]),
        ];
        Ok(Self {
            core,
            params_buf,
            meta_bufs,
            uniforms_groups,
            intermediate: None,
        })
    }

    fn intermediate_view(&mut self, gpu: &GpuContext, size: u32) -> &wgpu::TextureView {
        let stale = !matches!(&self.intermediate, Some((s, _)) if *s == size);
        if stale {
            let texture = gpu.create_target_texture(
                &format!("matforge.intermediate.{}", self.core.blueprint.name),
                size,
                size,
            );
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            self.intermediate = Some((size, view));
        }
        &self.intermediate.as_ref().unwrap().1
    }
}

impl Painter for TwoPassPainter {
    fn paint(&mut self, ctx: &PaintContext<'_>) -> Result<()> {
        let slots = pack_params(&self.core.blueprint, ctx.params);
        ctx.gpu
            .queue
            .write_buffer(&self.params_buf, 0, bytemuck::cast_slice(&slots));
        for (index, buf) in self.meta_bufs.iter().enumerate() {
            let meta = PassMeta {
                resolution: [ctx.size as f32, ctx.size as f32],
                pass_index: index as u32,
                _pad: 0,
            };
            ctx.gpu.queue.write_buffer(buf, 0, bytemuck::bytes_of(&meta));
        }

        // Pass 0: real inputs into the intermediate. The scope guard ends
        // with each run_pass, so the passes never overlap.
        let inputs_group = self.core.create_inputs_group(ctx.gpu, ctx.inputs);
        self.intermediate_view(ctx.gpu, ctx.size);
        let (_, intermediate) = self.intermediate.as_ref().unwrap();
        self.core.run_pass(
            ctx.gpu,
            &[intermediate],
            &self.uniforms_groups[0],
            inputs_group.as_ref(),
        )?;

        // Pass 1: intermediate replaces the primary input.
        let mut second_inputs: Vec<Option<InputBinding<'_>>> = ctx.inputs.to_vec();
        second_inputs[0] = Some(InputBinding {
            view: intermediate,
            filter: FilterMode::Linear,
        });
        let second_group = self.core.create_inputs_group(ctx.gpu, &second_inputs);
        let targets: Vec<&wgpu::TextureView> = ctx.targets.iter().collect();
        self.core.run_pass(
            ctx.gpu,
            &targets,
            &self.uniforms_groups[1],
            second_group.as_ref(),
        )
    }
}
