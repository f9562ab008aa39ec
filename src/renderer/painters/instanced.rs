//! Instanced pattern painter: stamps the node's input texture many times in
//! one draw. Placement transforms are computed on the CPU (deterministic,
//! testable without a device) and uploaded as an instance vertex buffer;
//! the blend mode selects a cached pipeline variant.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use glam::{Mat4, Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wgpu::util::DeviceExt as _;

use crate::blueprint::Blueprint;
use crate::renderer::gpu::{GpuContext, PassScope, TEXTURE_FORMAT};
use crate::renderer::wgsl::PATTERN_SHADER;
use crate::value::ParamValue;

use super::{PaintContext, Painter};

/// Hard ceiling on instances per draw. Tile skew can otherwise grow the
/// grid without bound as `offset` rises.
pub const MAX_INSTANCES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlendMode {
    Disabled,
    Add,
    Multiply,
    Subtract,
}

impl BlendMode {
    fn from_param(value: i32) -> Self {
        match value {
            1 => BlendMode::Add,
            2 => BlendMode::Multiply,
            3 => BlendMode::Subtract,
            _ => BlendMode::Disabled,
        }
    }

    fn state(self) -> Option<wgpu::BlendState> {
        let component = |operation, src_factor, dst_factor| wgpu::BlendComponent {
            src_factor,
            dst_factor,
            operation,
        };
        match self {
            BlendMode::Disabled => None,
            BlendMode::Add => Some(wgpu::BlendState {
                color: component(
                    wgpu::BlendOperation::Add,
                    wgpu::BlendFactor::One,
                    wgpu::BlendFactor::One,
                ),
                alpha: component(
                    wgpu::BlendOperation::Add,
                    wgpu::BlendFactor::One,
                    wgpu::BlendFactor::One,
                ),
            }),
            BlendMode::Multiply => Some(wgpu::BlendState {
                color: component(
                    wgpu::BlendOperation::Add,
                    wgpu::BlendFactor::Dst,
                    wgpu::BlendFactor::Zero,
                ),
                alpha: component(
                    wgpu::BlendOperation::Add,
                    wgpu::BlendFactor::DstAlpha,
                    wgpu::BlendFactor::Zero,
                ),
            }),
            // dst - src
            BlendMode::Subtract => Some(wgpu::BlendState {
                color: component(
                    wgpu::BlendOperation::ReverseSubtract,
                    wgpu::BlendFactor::One,
                    wgpu::BlendFactor::One,
                ),
                alpha: component(
                    wgpu::BlendOperation::Add,
                    wgpu::BlendFactor::One,
                    wgpu::BlendFactor::One,
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternLayout {
    Tile,
    Scatter,
}

/// Grid placement with per-row skew. `offset` shifts each row by that
/// fraction of a cell per row index; the column range is widened so skewed
/// rows stay covered, within the instance cap.
pub fn tile_transforms(count_x: u32, count_y: u32, offset: f32, scale: f32) -> Vec<Mat4> {
    let count_x = count_x.max(1);
    let count_y = count_y.max(1);
    let cell_w = 2.0 / count_x as f32;
    let cell_h = 2.0 / count_y as f32;
    let extra = (offset.abs() * count_y as f32).ceil() as i64;

    let mut transforms = Vec::new();
    'rows: for row in 0..count_y {
        let shift = offset * row as f32;
        let y = -1.0 + (row as f32 + 0.5) * cell_h;
        for col in -extra..(count_x as i64 + extra) {
            let x = -1.0 + (col as f32 + 0.5 + shift) * cell_w;
            if x < -1.0 - cell_w * 0.5 || x > 1.0 + cell_w * 0.5 {
                continue;
            }
            if transforms.len() >= MAX_INSTANCES {
                log::warn!(
                    "tile layout truncated at {MAX_INSTANCES} instances \
                     ({count_x}x{count_y}, offset {offset})"
                );
                break 'rows;
            }
            transforms.push(Mat4::from_scale_rotation_translation(
                Vec3::new(cell_w * 0.5 * scale, cell_h * 0.5 * scale, 1.0),
                Quat::IDENTITY,
                Vec3::new(x, y, 0.0),
            ));
        }
    }
    transforms
}

/// Seeded random placement. Identical inputs always produce the identical
/// layout; the rng is consumed in a fixed per-instance order so toggling
/// one parameter never reshuffles the others.
pub fn scatter_transforms(
    amount: u32,
    seed: u64,
    scale: f32,
    scale_jitter: f32,
    rotation: f32,
) -> Vec<Mat4> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = (amount as usize).min(MAX_INSTANCES);
    if (amount as usize) > MAX_INSTANCES {
        log::warn!("scatter layout truncated at {MAX_INSTANCES} instances (amount {amount})");
    }
    let mut transforms = Vec::with_capacity(count);
    for _ in 0..count {
        let x = rng.random_range(-1.0f32..1.0);
        let y = rng.random_range(-1.0f32..1.0);
        let size = (scale * (1.0 + scale_jitter * rng.random_range(-1.0f32..1.0))).max(0.0);
        let angle = rotation * rng.random_range(0.0f32..std::f32::consts::TAU);
        transforms.push(Mat4::from_scale_rotation_translation(
            Vec3::new(size, size, 1.0),
            Quat::from_rotation_z(angle),
            Vec3::new(x, y, 0.0),
        ));
    }
    transforms
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { pos: [-1.0, -1.0], uv: [0.0, 1.0] },
    QuadVertex { pos: [1.0, -1.0], uv: [1.0, 1.0] },
    QuadVertex { pos: [1.0, 1.0], uv: [1.0, 0.0] },
    QuadVertex { pos: [-1.0, 1.0], uv: [0.0, 0.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

pub struct InstancedPainter {
    blueprint: Arc<Blueprint>,
    layout_kind: PatternLayout,
    bind_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    module: wgpu::ShaderModule,
    pipelines: HashMap<BlendMode, wgpu::RenderPipeline>,
    vertex_buf: wgpu::Buffer,
    index_buf: wgpu::Buffer,
}

impl InstancedPainter {
    pub fn new(gpu: &GpuContext, blueprint: Arc<Blueprint>) -> Result<Self> {
        let layout_kind = match blueprint.pattern.as_deref() {
            Some("tile") => PatternLayout::Tile,
            Some("scatter") => PatternLayout::Scatter,
            Some(other) => bail!(
                "blueprint '{}': unknown pattern layout '{other}'",
                blueprint.name
            ),
            None => bail!("blueprint '{}' declares no pattern layout", blueprint.name),
        };
        if blueprint.primary_input().is_none() {
            bail!(
                "pattern blueprint '{}' must declare an input socket",
                blueprint.name
            );
        }

        let bind_layout = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("matforge.pattern.bind_layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                ],
            });
        let pipeline_layout =
            gpu.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("matforge.pattern.pipeline_layout"),
                    bind_group_layouts: &[&bind_layout],
                    push_constant_ranges: &[],
                });
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("matforge.pattern.shader"),
                source: wgpu::ShaderSource::Wgsl(PATTERN_SHADER.into()),
            });
        let vertex_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("matforge.pattern.quad"),
                contents: bytemuck::cast_slice(&QUAD_VERTICES),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("matforge.pattern.indices"),
                contents: bytemuck::cast_slice(&QUAD_INDICES),
                usage: wgpu::BufferUsages::INDEX,
            });

        Ok(Self {
            blueprint,
            layout_kind,
            bind_layout,
            pipeline_layout,
            module,
            pipelines: HashMap::new(),
            vertex_buf,
            index_buf,
        })
    }

    fn pipeline(&mut self, gpu: &GpuContext, mode: BlendMode) -> &wgpu::RenderPipeline {
        self.pipelines.entry(mode).or_insert_with(|| {
            gpu.device
                .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some("matforge.pattern.pipeline"),
                    layout: Some(&self.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &self.module,
                        entry_point: Some("vs_main"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        buffers: &[
                            wgpu::VertexBufferLayout {
                                array_stride: std::mem::size_of::<QuadVertex>() as u64,
                                step_mode: wgpu::VertexStepMode::Vertex,
                                attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                            },
                            wgpu::VertexBufferLayout {
                                array_stride: 64,
                                step_mode: wgpu::VertexStepMode::Instance,
                                attributes: &wgpu::vertex_attr_array![
                                    2 => Float32x4, 3 => Float32x4,
                                    4 => Float32x4, 5 => Float32x4
                                ],
                            },
                        ],
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &self.module,
                        entry_point: Some("fs_main"),
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: TEXTURE_FORMAT,
                            blend: mode.state(),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
        })
    }

    fn compute_transforms(&self, params: &std::collections::BTreeMap<String, ParamValue>) -> Vec<Mat4> {
        let scalar = |name: &str, fallback: f32| {
            params.get(name).and_then(ParamValue::as_scalar).unwrap_or(fallback)
        };
        let int = |name: &str, fallback: i32| {
            params.get(name).and_then(ParamValue::as_int).unwrap_or(fallback)
        };
        match self.layout_kind {
            PatternLayout::Tile => tile_transforms(
                int("countX", 4).max(0) as u32,
                int("countY", 4).max(0) as u32,
                scalar("offset", 0.0),
                scalar("scale", 1.0),
            ),
            PatternLayout::Scatter => scatter_transforms(
                int("amount", 16).max(0) as u32,
                int("seed", 0) as u64,
                scalar("scale", 0.25),
                scalar("scaleJitter", 0.0),
                scalar("rotation", 0.0),
            ),
        }
    }
}

impl Painter for InstancedPainter {
    fn paint(&mut self, ctx: &PaintContext<'_>) -> Result<()> {
        let target = ctx
            .targets
            .first()
            .ok_or_else(|| anyhow!("pattern node has no output target"))?;
        let transforms = self.compute_transforms(ctx.params);
        let instance_data: Vec<[f32; 16]> =
            transforms.iter().map(Mat4::to_cols_array).collect();
        let mode = BlendMode::from_param(
            ctx.params
                .get("blendMode")
                .and_then(ParamValue::as_int)
                .unwrap_or(0),
        );

        let (view, filter) = match &ctx.inputs.first().copied().flatten() {
            Some(binding) => (binding.view, binding.filter),
            None => (ctx.gpu.placeholder_view(), Default::default()),
        };
        let bind_group = ctx
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("matforge.pattern.bind"),
                layout: &self.bind_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Sampler(ctx.gpu.sampler(filter)),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                ],
            });

        let instance_buf = (!instance_data.is_empty()).then(|| {
            ctx.gpu
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("matforge.pattern.instances"),
                    contents: bytemuck::cast_slice(&instance_data),
                    usage: wgpu::BufferUsages::VERTEX,
                })
        });

        self.pipeline(ctx.gpu, mode);
        let pipeline = &self.pipelines[&mode];

        let _scope = PassScope::begin(ctx.gpu)?;
        let mut encoder = ctx
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("matforge.encode.{}", self.blueprint.name)),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&format!("matforge.pass.{}", self.blueprint.name)),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if let Some(instances) = &instance_buf {
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, self.vertex_buf.slice(..));
                pass.set_vertex_buffer(1, instances.slice(..));
                pass.set_index_buffer(self.index_buf.slice(..), wgpu::IndexFormat::Uint16);
                pass.draw_indexed(0..6, 0, 0..instance_data.len() as u32);
            }
        }
        ctx.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_without_skew_fills_the_grid_exactly() {
        let transforms = tile_transforms(4, 3, 0.0, 1.0);
        assert_eq!(transforms.len(), 12);
    }

    #[test]
    fn tile_skew_growth_is_bounded() {
        // A pathological offset must clamp instead of exploding.
        let transforms = tile_transforms(64, 64, 1000.0, 1.0);
        assert!(transforms.len() <= MAX_INSTANCES);
    }

    #[test]
    fn scatter_is_deterministic_per_seed() {
        let a = scatter_transforms(32, 7, 0.25, 0.5, 1.0);
        let b = scatter_transforms(32, 7, 0.25, 0.5, 1.0);
        let c = scatter_transforms(32, 8, 0.25, 0.5, 1.0);
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn scatter_amount_is_capped() {
        let transforms = scatter_transforms(100_000, 0, 0.1, 0.0, 0.0);
        assert_eq!(transforms.len(), MAX_INSTANCES);
    }
}
