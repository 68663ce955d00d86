//! Forward pipeline driver
//!
//! One pass, direct draws, no culling compute. Shares the frame-resource
//! arena and timeline protocol with the deferred path, so switching
//! pipelines changes nothing about how constants reach the GPU. Each visible
//! item draws with its object slot as the instance range, the same
//! addressing the indirect path uses.

use cgmath::{Matrix4, SquareMatrix};
use std::sync::Arc;

use crate::camera::{extract_frustum_planes, Camera};
use crate::error::{EngineError, EngineResult};
use crate::pipeline::context::RenderContext;
use crate::pipeline::gbuffer::DEPTH_FORMAT;
use crate::scene::{ItemIndex, ItemStore, Material, MaterialIndex, MaterialStore, RenderItem, RenderLayer};
use crate::sync::GpuTimeline;
use crate::upload::frame_packer::{Light, MaterialConstants, PassConstants, VERTEX_STRIDE};
use crate::upload::{FrameArena, FrameRegionOffsets};

pub struct ForwardPipeline {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    timeline: GpuTimeline,
    arena: FrameArena,

    items: ItemStore,
    materials: MaterialStore,

    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    fallback_materials: wgpu::Buffer,
    depth_view: wgpu::TextureView,

    current_region: Option<FrameRegionOffsets>,
    /// (slot, index_count, first_index, base_vertex) per visible item, in
    /// packing order.
    frame_draws: Vec<(u32, u32, u32, i32)>,
    object_count: u32,

    width: u32,
    height: u32,
}

impl ForwardPipeline {
    pub fn new(context: &RenderContext, arena_capacity: u64) -> Self {
        use wgpu::util::DeviceExt;

        let device = &context.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Forward Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/forward.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Forward Layout"),
            entries: &[
                // Pass constants
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
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
                // Material table
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
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
            label: Some("Forward Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Forward Pipeline"),
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
                targets: &[Some(wgpu::ColorTargetState {
                    format: context.surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
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

        let fallback = MaterialConstants {
            diffuse_albedo: [1.0, 1.0, 1.0, 1.0],
            fresnel_r0: [0.04, 0.04, 0.04],
            roughness: 0.5,
            transform: Matrix4::identity().into(),
            diffuse_map_index: 0,
            normal_map_index: 0,
            _pad: [0; 2],
        };
        let fallback_materials = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Fallback Material Table"),
            contents: bytemuck::bytes_of(&fallback),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let depth_view = Self::create_depth(device, context.width, context.height);

        log::info!(
            "[ForwardPipeline::new] {}x{}, arena {} MiB",
            context.width,
            context.height,
            arena_capacity / (1024 * 1024)
        );

        Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            timeline: GpuTimeline::new(),
            arena: FrameArena::new(device, arena_capacity),
            items: ItemStore::new(),
            materials: MaterialStore::new(),
            pipeline,
            bind_group_layout,
            fallback_materials,
            depth_view,
            current_region: None,
            frame_draws: Vec::new(),
            object_count: 0,
            width: context.width,
            height: context.height,
        }
    }

    fn create_depth(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
        device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Forward Depth"),
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
            .create_view(&wgpu::TextureViewDescriptor::default())
    }

    pub fn timeline(&self) -> &GpuTimeline {
        &self.timeline
    }

    pub fn items(&self) -> &ItemStore {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut ItemStore {
        &mut self.items
    }

    pub fn push_material(&mut self, material: Material) -> MaterialIndex {
        self.materials.insert(material)
    }

    pub fn push_model(&mut self, item: RenderItem) -> EngineResult<ItemIndex> {
        self.flush()?;
        self.items.try_add(item)
    }

    pub fn push_models(&mut self, models: Vec<RenderItem>) -> EngineResult<Vec<ItemIndex>> {
        self.flush()?;
        models.into_iter().map(|m| self.items.try_add(m)).collect()
    }

    pub fn push_visible_models(&mut self, layer: RenderLayer, indices: &[ItemIndex]) {
        for &index in indices {
            self.items.add_visible(layer, index);
        }
    }

    pub fn update(
        &mut self,
        camera: &mut Camera,
        total_time: f32,
        delta_time: f32,
    ) -> EngineResult<()> {
        self.device.poll(wgpu::Maintain::Poll);
        self.arena.reclaim(&self.timeline);

        let mut visible = Vec::new();
        for layer in RenderLayer::ALL {
            visible.extend_from_slice(self.items.visible_items(layer));
        }
        self.object_count = visible.len() as u32;

        let pass = self.build_pass_constants(camera, total_time, delta_time);
        let region = self.arena.upload_frame(
            &self.queue,
            &self.timeline,
            &visible,
            &mut self.items,
            &mut self.materials,
            &pass,
        )?;

        self.frame_draws.clear();
        for (slot, &index) in visible.iter().enumerate() {
            if let Some(item) = self.items.get(index) {
                self.frame_draws.push((
                    slot as u32,
                    item.indices.len() as u32,
                    item.start_index,
                    item.base_vertex as i32,
                ));
            }
        }

        self.current_region = Some(region);
        self.items.clear_visible();
        camera.clear_dirty();
        Ok(())
    }

    pub fn draw(&mut self, target: &wgpu::TextureView) -> EngineResult<()> {
        let region = self.current_region.take().ok_or(EngineError::Internal {
            message: "draw called without a prior update".into(),
        })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Forward Frame Encoder"),
            });

        {
            // Created ahead of the pass: the pass borrows it for its whole
            // lifetime.
            let bind_group = self.create_bind_group(&region);
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Forward Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
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

            if !self.frame_draws.is_empty() && region.sizes.object > 0 {
                let arena = self.arena.buffer();
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(
                    0,
                    arena.slice(region.vertex_begin..region.vertex_begin + region.sizes.vertex),
                );
                pass.set_index_buffer(
                    arena.slice(region.index_begin..region.index_begin + region.sizes.index),
                    wgpu::IndexFormat::Uint32,
                );
                for &(slot, index_count, first_index, base_vertex) in &self.frame_draws {
                    pass.draw_indexed(
                        first_index..first_index + index_count,
                        base_vertex,
                        slot..slot + 1,
                    );
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        let fence = self.timeline.signal();
        self.arena.finish_frame(fence);
        let timeline = self.timeline.clone();
        self.queue.on_submitted_work_done(move || {
            timeline.mark_completed(fence);
        });
        Ok(())
    }

    fn create_bind_group(&self, region: &FrameRegionOffsets) -> wgpu::BindGroup {
        let materials_binding = if region.sizes.material > 0 {
            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: self.arena.buffer(),
                offset: region.material_begin,
                size: wgpu::BufferSize::new(region.sizes.material),
            })
        } else {
            self.fallback_materials.as_entire_binding()
        };

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Forward Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.arena.buffer(),
                        offset: region.pass_begin,
                        size: wgpu::BufferSize::new(
                            std::mem::size_of::<PassConstants>() as u64
                        ),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.arena.buffer(),
                        offset: region.object_begin,
                        size: wgpu::BufferSize::new(region.sizes.object),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: materials_binding,
                },
            ],
        })
    }

    fn build_pass_constants(
        &self,
        camera: &Camera,
        total_time: f32,
        delta_time: f32,
    ) -> PassConstants {
        let view = camera.build_view_matrix();
        let proj = camera.build_projection_matrix();
        let view_proj = proj * view;
        let identity = Matrix4::identity();

        let mut lights = [Light::default(); crate::constants::scene::MAX_LIGHTS];
        lights[0] = Light {
            strength: [0.9, 0.9, 0.9],
            falloff_start: 1.0,
            direction: [0.57735, -0.57735, 0.57735],
            falloff_end: 10.0,
            position: [0.0; 3],
            spot_power: 64.0,
        };

        PassConstants {
            view: view.into(),
            inv_view: view.invert().unwrap_or(identity).into(),
            proj: proj.into(),
            inv_proj: proj.invert().unwrap_or(identity).into(),
            view_proj: view_proj.into(),
            inv_view_proj: view_proj.invert().unwrap_or(identity).into(),
            frustum_planes: extract_frustum_planes(&view_proj),
            eye_pos: [camera.position.x, camera.position.y, camera.position.z],
            _pad0: 0.0,
            render_target_size: [self.width as f32, self.height as f32],
            inv_render_target_size: [1.0 / self.width as f32, 1.0 / self.height as f32],
            near_z: camera.near,
            far_z: camera.far,
            total_time,
            delta_time,
            ambient_light: [0.25, 0.25, 0.35, 1.0],
            object_count: self.object_count,
            hiz_mip_count: 0,
            _pad1: [0; 2],
            lights,
        }
    }

    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || (width == self.width && height == self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.depth_view = Self::create_depth(&self.device, width, height);
    }

    pub fn flush(&mut self) -> EngineResult<()> {
        self.arena.drain(&self.timeline)
    }
}
