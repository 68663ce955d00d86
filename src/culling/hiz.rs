//! Hierarchical depth pyramid
//!
//! An R32Float mip chain over the occluder depth image. Level 0 is rendered
//! by a depth prepass over the Occluder layer; each further level min-reduces
//! the previous one, so with reversed depth a texel always holds the farthest
//! occluder point over its footprint. The culling passes sample it to reject
//! objects that sit behind every occluder.

use std::sync::Arc;

use crate::culling::validation::mip_count;
use crate::upload::frame_packer::{PassConstants, VERTEX_STRIDE};
use crate::upload::FrameRegionOffsets;

pub struct HiZPyramid {
    texture: wgpu::Texture,
    views: Vec<wgpu::TextureView>,
    full_view: wgpu::TextureView,
    sampler: wgpu::Sampler,

    downsample_pipeline: wgpu::ComputePipeline,
    downsample_layout: wgpu::BindGroupLayout,
    downsample_groups: Vec<wgpu::BindGroup>,

    prepass_pipeline: wgpu::RenderPipeline,
    prepass_layout: wgpu::BindGroupLayout,
    depth_view: wgpu::TextureView,

    width: u32,
    height: u32,
    mip_levels: u32,
}

impl HiZPyramid {
    pub fn new(device: &Arc<wgpu::Device>, width: u32, height: u32) -> Self {
        let downsample_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HiZ Downsample Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../shaders/hiz_downsample.wgsl").into(),
            ),
        });

        let downsample_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("HiZ Downsample Layout"),
                entries: &[
                    // Source level
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    // Destination level
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::R32Float,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });

        let downsample_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("HiZ Downsample Pipeline Layout"),
                bind_group_layouts: &[&downsample_layout],
                push_constant_ranges: &[],
            });

        let downsample_pipeline =
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("HiZ Downsample Pipeline"),
                layout: Some(&downsample_pipeline_layout),
                module: &downsample_shader,
                entry_point: "downsample",
            });

        let prepass_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Depth Prepass Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/depth_prepass.wgsl").into()),
        });

        let prepass_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Depth Prepass Layout"),
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

        let prepass_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Depth Prepass Pipeline Layout"),
                bind_group_layouts: &[&prepass_layout],
                push_constant_ranges: &[],
            });

        let prepass_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Depth Prepass Pipeline"),
            layout: Some(&prepass_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &prepass_shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x3],
                }],
            },
            fragment: Some(wgpu::FragmentState {
                module: &prepass_shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::R32Float,
                    blend: None,
                    write_mask: wgpu::ColorWrites::RED,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: Some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: true,
                // Reversed depth: nearer is greater.
                depth_compare: wgpu::CompareFunction::Greater,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let (texture, views, full_view, depth_view, mip_levels) =
            Self::create_targets(device, width, height);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("HiZ Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let downsample_groups =
            Self::create_downsample_groups(device, &downsample_layout, &views);

        Self {
            texture,
            views,
            full_view,
            sampler,
            downsample_pipeline,
            downsample_layout,
            downsample_groups,
            prepass_pipeline,
            prepass_layout,
            depth_view,
            width,
            height,
            mip_levels,
        }
    }

    fn create_targets(
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> (
        wgpu::Texture,
        Vec<wgpu::TextureView>,
        wgpu::TextureView,
        wgpu::TextureView,
        u32,
    ) {
        let mip_levels = mip_count(width, height);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("HiZ Pyramid"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let mut views = Vec::with_capacity(mip_levels as usize);
        for level in 0..mip_levels {
            views.push(texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&format!("HiZ Mip {} View", level)),
                format: Some(wgpu::TextureFormat::R32Float),
                dimension: Some(wgpu::TextureViewDimension::D2),
                aspect: wgpu::TextureAspect::All,
                base_mip_level: level,
                mip_level_count: Some(1),
                base_array_layer: 0,
                array_layer_count: None,
            }));
        }
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("HiZ Full Chain View"),
            ..Default::default()
        });

        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Occluder Depth"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

        (texture, views, full_view, depth_view, mip_levels)
    }

    fn create_downsample_groups(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        views: &[wgpu::TextureView],
    ) -> Vec<wgpu::BindGroup> {
        (1..views.len())
            .map(|level| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("HiZ Downsample Group {}", level)),
                    layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&views[level - 1]),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&views[level]),
                        },
                    ],
                })
            })
            .collect()
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The whole chain, for sampling in the culling shaders.
    pub fn chain_view(&self) -> &wgpu::TextureView {
        &self.full_view
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    /// Draw the Occluder layer into level 0. Clears to depth 0.0 (the far
    /// plane, reversed), so an empty occluder set culls nothing.
    pub fn render_occluder_depth(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        arena: &wgpu::Buffer,
        region: &FrameRegionOffsets,
        occluder_slots: &[(u32, u32, u32, i32)],
    ) {
        // Created ahead of the pass: the pass borrows it for its whole
        // lifetime. The pass itself always runs so the clear happens even
        // with no occluders.
        let bind_group = if occluder_slots.is_empty() || region.sizes.object == 0 {
            None
        } else {
            Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Depth Prepass Bind Group"),
                layout: &self.prepass_layout,
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
            label: Some("Occluder Depth Prepass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.views[0],
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
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

        pass.set_pipeline(&self.prepass_pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_vertex_buffer(0, arena.slice(region.vertex_begin..region.vertex_begin + region.sizes.vertex));
        pass.set_index_buffer(
            arena.slice(region.index_begin..region.index_begin + region.sizes.index),
            wgpu::IndexFormat::Uint32,
        );

        for &(slot, index_count, first_index, base_vertex) in occluder_slots {
            pass.draw_indexed(
                first_index..first_index + index_count,
                base_vertex,
                slot..slot + 1,
            );
        }
    }

    /// Min-reduce level k-1 into level k for the whole chain.
    pub fn build_mip_chain(&self, encoder: &mut wgpu::CommandEncoder) {
        use crate::constants::culling::HIZ_WORKGROUP_DIM;
        for level in 1..self.mip_levels {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("HiZ Downsample Mip {}", level)),
                timestamp_writes: None,
            });
            let mip_width = (self.width >> level).max(1);
            let mip_height = (self.height >> level).max(1);
            pass.set_pipeline(&self.downsample_pipeline);
            pass.set_bind_group(0, &self.downsample_groups[(level - 1) as usize], &[]);
            pass.dispatch_workgroups(
                (mip_width + HIZ_WORKGROUP_DIM - 1) / HIZ_WORKGROUP_DIM,
                (mip_height + HIZ_WORKGROUP_DIM - 1) / HIZ_WORKGROUP_DIM,
                1,
            );
        }
    }

    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        log::info!(
            "[HiZPyramid::resize] {}x{} -> {}x{}",
            self.width,
            self.height,
            width,
            height
        );
        let (texture, views, full_view, depth_view, mip_levels) =
            Self::create_targets(device, width, height);
        self.downsample_groups =
            Self::create_downsample_groups(device, &self.downsample_layout, &views);
        self.texture = texture;
        self.views = views;
        self.full_view = full_view;
        self.depth_view = depth_view;
        self.width = width;
        self.height = height;
        self.mip_levels = mip_levels;
    }
}
