//! Single-pass shader painter: one generated pipeline, one fullscreen draw.

use std::sync::Arc;

use anyhow::Result;

use crate::blueprint::Blueprint;
use crate::renderer::gpu::{GpuContext, PassScope, TEXTURE_FORMAT};
use crate::renderer::wgsl::{PARAM_SLOTS, generate_node_shader, validate_wgsl};

use super::{InputBinding, PaintContext, Painter, PassMeta, pack_params};

pub(super) const PARAMS_BUFFER_SIZE: u64 = (PARAM_SLOTS * 16) as u64;
pub(super) const META_BUFFER_SIZE: u64 = std::mem::size_of::<PassMeta>() as u64;

/// Pipeline and bind group layouts shared by the single-pass and two-pass
/// painters; both drive the same generated shader, they differ only in how
/// many times they run it and at which targets.
pub(super) struct ShaderCore {
    pub blueprint: Arc<Blueprint>,
    pub pipeline: wgpu::RenderPipeline,
    pub uniforms_layout: wgpu::BindGroupLayout,
    pub inputs_layout: Option<wgpu::BindGroupLayout>,
}

impl ShaderCore {
    pub fn new(gpu: &GpuContext, blueprint: Arc<Blueprint>) -> Result<Self> {
        let source = generate_node_shader(&blueprint)?;
        validate_wgsl(&source)?;
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("matforge.shader.{}", blueprint.name)),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let uniform_entry = |binding: u32, size: u64| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(size),
            },
            count: None,
        };
        let uniforms_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("matforge.uniforms.{}", blueprint.name)),
                    entries: &[
                        uniform_entry(0, PARAMS_BUFFER_SIZE),
                        uniform_entry(1, META_BUFFER_SIZE),
                    ],
                });

        let inputs_layout = if blueprint.inputs.is_empty() {
            None
        } else {
            let mut entries = Vec::with_capacity(blueprint.inputs.len() * 2);
            for i in 0..blueprint.inputs.len() as u32 {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: i * 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: i * 2 + 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                });
            }
            Some(gpu.device.create_bind_group_layout(
                &wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("matforge.inputs.{}", blueprint.name)),
                    entries: &entries,
                },
            ))
        };

        let mut group_layouts: Vec<&wgpu::BindGroupLayout> = vec![&uniforms_layout];
        if let Some(layout) = &inputs_layout {
            group_layouts.push(layout);
        }
        let pipeline_layout =
            gpu.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(&format!("matforge.layout.{}", blueprint.name)),
                    bind_group_layouts: &group_layouts,
                    push_constant_ranges: &[],
                });

        let targets: Vec<Option<wgpu::ColorTargetState>> = blueprint
            .outputs
            .iter()
            .map(|_| {
                Some(wgpu::ColorTargetState {
                    format: TEXTURE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let pipeline = gpu
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&format!("matforge.pipeline.{}", blueprint.name)),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });

        Ok(Self {
            blueprint,
            pipeline,
            uniforms_layout,
            inputs_layout,
        })
    }

    pub fn create_uniform_buffer(&self, gpu: &GpuContext, label: &str, size: u64) -> wgpu::Buffer {
        gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub fn create_uniforms_group(
        &self,
        gpu: &GpuContext,
        params_buf: &wgpu::Buffer,
        meta_buf: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("matforge.uniforms.{}", self.blueprint.name)),
            layout: &self.uniforms_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: meta_buf.as_entire_binding(),
                },
            ],
        })
    }

    /// Bind the resolved inputs; unconnected sockets get the placeholder.
    pub fn create_inputs_group(
        &self,
        gpu: &GpuContext,
        inputs: &[Option<InputBinding<'_>>],
    ) -> Option<wgpu::BindGroup> {
        let layout = self.inputs_layout.as_ref()?;
        let mut entries = Vec::with_capacity(inputs.len() * 2);
        for (i, input) in inputs.iter().enumerate() {
            let (view, filter) = match input {
                Some(binding) => (binding.view, binding.filter),
                None => (gpu.placeholder_view(), Default::default()),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: (i * 2) as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: (i * 2 + 1) as u32,
                resource: wgpu::BindingResource::Sampler(gpu.sampler(filter)),
            });
        }
        Some(gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("matforge.inputs.{}", self.blueprint.name)),
            layout,
            entries: &entries,
        }))
    }

    /// Encode and submit one fullscreen pass at the given targets.
    pub fn run_pass(
        &self,
        gpu: &GpuContext,
        targets: &[&wgpu::TextureView],
        uniforms_group: &wgpu::BindGroup,
        inputs_group: Option<&wgpu::BindGroup>,
    ) -> Result<()> {
        let _scope = PassScope::begin(gpu)?;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("matforge.encode.{}", self.blueprint.name)),
            });
        {
            let attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = targets
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&format!("matforge.pass.{}", self.blueprint.name)),
                color_attachments: &attachments,
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, uniforms_group, &[]);
            if let Some(group) = inputs_group {
                pass.set_bind_group(1, group, &[]);
            }
            pass.draw(0..3, 0..1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

pub struct SinglePassPainter {
    core: ShaderCore,
    params_buf: wgpu::Buffer,
    meta_buf: wgpu::Buffer,
    uniforms_group: wgpu::BindGroup,
}

impl SinglePassPainter {
    pub fn new(gpu: &GpuContext, blueprint: Arc<Blueprint>) -> Result<Self> {
        let core = ShaderCore::new(gpu, blueprint)?;
        let params_buf =
            core.create_uniform_buffer(gpu, "matforge.params", PARAMS_BUFFER_SIZE);
        let meta_buf = core.create_uniform_buffer(gpu, "matforge.meta", META_BUFFER_SIZE);
        let uniforms_group = core.create_uniforms_group(gpu, &params_buf, &meta_buf);
        Ok(Self {
            core,
            params_buf,
            meta_buf,
            uniforms_group,
        })
    }
}

impl Painter for SinglePassPainter {
    fn paint(&mut self, ctx: &PaintContext<'_>) -> Result<()> {
        let slots = pack_params(&self.core.blueprint, ctx.params);
        ctx.gpu
            .queue
            .write_buffer(&self.params_buf, 0, bytemuck::cast_slice(&slots));
        let meta = PassMeta {
            resolution: [ctx.size as f32, ctx.size as f32],
            pass_index: 0,
            _pad: 0,
        };
        ctx.gpu
            .queue
            .write_buffer(&self.meta_buf, 0, bytemuck::bytes_of(&meta));

        let inputs_group = self.core.create_inputs_group(ctx.gpu, ctx.inputs);
        let targets: Vec<&wgpu::TextureView> = ctx.targets.iter().collect();
        self.core
            .run_pass(ctx.gpu, &targets, &self.uniforms_group, inputs_group.as_ref())
    }
}
