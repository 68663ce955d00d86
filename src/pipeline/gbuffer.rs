//! G-Buffer targets and the indirect fill pass
//!
//! Two Rgba16Float attachments (normal + material index, world position +
//! depth) plus a reversed depth buffer. The fill pass draws whatever the
//! cluster-culling pass emitted, via `multi_draw_indexed_indirect_count`, so
//! its cost tracks survivors rather than scene size.

use std::sync::Arc;

use crate::culling::AppendBuffer;
use crate::upload::frame_packer::{PassConstants, VERTEX_STRIDE};
use crate::upload::FrameRegionOffsets;

pub const GBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

pub struct GBuffer {
    normal_view: wgpu::TextureView,
    position_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,

    fill_pipeline: wgpu::RenderPipeline,
    fill_layout: wgpu::BindGroupLayout,

    width: u32,
    height: u32,
}

impl GBuffer {
    pub fn new(device: &Arc<wgpu::Device>, width: u32, height: u32) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("GBuffer Fill Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/gbuffer_fill.wgsl").into()),
        });

        let fill_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("GBuffer Fill Layout"),
            entries: &[
                // Pass constants
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Object constants
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("GBuffer Fill Pipeline Layout"),
            bind_group_layouts: &[&fill_layout],
            push_constant_ranges: &[],
        });

        let fill_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("GBuffer Fill Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![
                        0 => Float32x3,
                        1 => Float32x3,
                        2 => Float32x3,
                        3 => Float32x2,
                    ],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[
                    Some(wgpu::ColorTargetState {
                        format: GBUFFER_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    }),
                    Some(wgpu::ColorTargetState {
                        format: GBUFFER_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    }),
                ],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Greater,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let (normal_view, position_view, depth_view) = Self::create_targets(device, width, height);

        Self {
            normal_view,
            position_view,
            depth_view,
            fill_pipeline,
            fill_layout,
            width,
            height,
        }
    }

    fn create_targets(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (wgpu::TextureView, wgpu::TextureView, wgpu::TextureView) {
        let color = |label: &str| {
            device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: GBUFFER_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        };
        let depth = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("GBuffer Depth"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        (
            color("GBuffer Normal/Material"),
            color("GBuffer Position/Depth"),
            depth,
        )
    }

    pub fn normal_view(&self) -> &wgpu::TextureView {
        &self.normal_view
    }

    pub fn position_view(&self) -> &wgpu::TextureView {
        &self.position_view
    }

    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        let (normal_view, position_view, depth_view) = Self::create_targets(device, width, height);
        self.normal_view = normal_view;
        self.position_view = position_view;
        self.depth_view = depth_view;
        self.width = width;
        self.height = height;
    }

    /// Clear the targets and draw the culled command list.
    pub fn fill(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        arena: &wgpu::Buffer,
        region: &FrameRegionOffsets,
        commands: &AppendBuffer,
        max_draws: u32,
    ) {
        // Created ahead of the pass: the pass borrows it for its whole
        // lifetime. The pass itself always runs so the clears happen even
        // with an empty frame.
        let bind_group = if max_draws == 0 || region.sizes.object == 0 {
            None
        } else {
            Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("GBuffer Fill Bind Group"),
                layout: &self.fill_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: arena,
                            offset: region.pass_begin,
                            size: wgpu::BufferSize::new(
                                std::mem::size_of::<PassConstants>() as u64
                            ),
                        }),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: arena,
                            offset: region.object_begin,
                            size: wgpu::BufferSize::new(region.sizes.object),
                        }),
                    },
                ],
            }))
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("GBuffer Fill Pass"),
            color_attachments: &[
                Some(wgpu::RenderPassColorAttachment {
                    view: &self.normal_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                }),
                Some(wgpu::RenderPassColorAttachment {
                    view: &self.position_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                }),
            ],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        });

        let bind_group = match &bind_group {
            Some(bind_group) => bind_group,
            None => return,
        };

        pass.set_pipeline(&self.fill_pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_vertex_buffer(
            0,
            arena.slice(region.vertex_begin..region.vertex_begin + region.sizes.vertex),
        );
        pass.set_index_buffer(
            arena.slice(region.index_begin..region.index_begin + region.sizes.index),
            wgpu::IndexFormat::Uint32,
        );
        pass.multi_draw_indexed_indirect_count(
            commands.buffer(),
            0,
            commands.buffer(),
            commands.counter_offset(),
            max_draws,
        );
    }
}
