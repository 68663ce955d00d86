//! Deferred pipeline driver
//!
//! Owns the whole frame: ring-buffered constant upload in `update`, then the
//! GPU-driven pass chain in `draw` (occluder prepass, pyramid build, the
//! three culling dispatches, indirect G-Buffer fill, full-screen shading
//! resolve) before signalling the timeline for the frame just submitted.

use cgmath::{Matrix4, Rad, SquareMatrix, Vector3};
use std::sync::Arc;

use crate::camera::{extract_frustum_planes, Camera};
use crate::constants::scene::{chunk_count_for, cluster_count_for};
use crate::culling::{
    AppendBuffer, ChunkExpandPass, ClusterCullPass, CounterResetSource, HiZPyramid,
    InstanceCullPass,
};
use crate::error::{EngineError, EngineResult};
use crate::pipeline::context::RenderContext;
use crate::pipeline::gbuffer::GBuffer;
use crate::scene::{ItemIndex, ItemStore, Material, MaterialIndex, MaterialStore, RenderItem, RenderLayer};
use crate::sync::GpuTimeline;
use crate::upload::frame_packer::{
    ClusterBounds, IndirectCommand, Light, MaterialConstants, PassConstants,
};
use crate::upload::{FrameArena, FrameRegionOffsets};

const BASE_LIGHT_DIRECTIONS: [[f32; 3]; 3] = [
    [0.57735, -0.57735, 0.57735],
    [-0.57735, -0.57735, 0.57735],
    [0.0, -0.707, -0.707],
];

struct ShadingResolve {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    /// One default material so the bind group is valid before any material
    /// is pushed.
    fallback_materials: wgpu::Buffer,
}

impl ShadingResolve {
    fn new(device: &wgpu::Device, surface_format: wgpu::TextureFormat) -> Self {
        use wgpu::util::DeviceExt;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Deferred Shading Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../shaders/deferred_shading.wgsl").into(),
            ),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Deferred Shading Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
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
            label: Some("Deferred Shading Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Deferred Shading Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
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

        Self {
            pipeline,
            layout,
            fallback_materials,
        }
    }
}

pub struct DeferredPipeline {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    timeline: GpuTimeline,
    arena: FrameArena,

    items: ItemStore,
    materials: MaterialStore,

    hiz: HiZPyramid,
    instance_cull: InstanceCullPass,
    chunk_expand: ChunkExpandPass,
    cluster_cull: ClusterCullPass,
    instance_chunks: AppendBuffer,
    cluster_chunks: AppendBuffer,
    draw_commands: AppendBuffer,
    counter_zero: CounterResetSource,

    /// Local-space bounds per cluster, indexed by each object's
    /// `cluster_base`. Rebuilt whenever geometry is added.
    cluster_table: Vec<ClusterBounds>,
    cluster_bounds: wgpu::Buffer,

    gbuffer: GBuffer,
    shading: ShadingResolve,

    // Frame state produced by `update`, consumed by `draw`.
    current_region: Option<FrameRegionOffsets>,
    frame_visible: Vec<ItemIndex>,
    occluder_slots: Vec<(u32, u32, u32, i32)>,
    frame_chunks: u32,
    frame_clusters: u32,

    width: u32,
    height: u32,
}

impl DeferredPipeline {
    pub fn new(context: &RenderContext, arena_capacity: u64) -> Self {
        use crate::constants::scene::{MAX_CLUSTER_CHUNKS, MAX_INSTANCE_CHUNKS};
        use crate::upload::frame_packer::{ClusterChunk, InstanceChunk};
        use wgpu::util::DeviceExt;

        let device = &context.device;
        // A single zeroed entry keeps the bind group valid before any
        // geometry is pushed.
        let cluster_bounds = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cluster Bounds Table"),
            contents: bytemuck::bytes_of(&ClusterBounds::default()),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });
        let instance_chunks = AppendBuffer::new(
            device,
            "Instance Chunk Buffer",
            MAX_INSTANCE_CHUNKS,
            std::mem::size_of::<InstanceChunk>() as u64,
        );
        let cluster_chunks = AppendBuffer::new(
            device,
            "Cluster Chunk Buffer",
            MAX_CLUSTER_CHUNKS,
            std::mem::size_of::<ClusterChunk>() as u64,
        );
        let draw_commands = AppendBuffer::new(
            device,
            "Indirect Command Buffer",
            MAX_CLUSTER_CHUNKS,
            std::mem::size_of::<IndirectCommand>() as u64,
        );

        log::info!(
            "[DeferredPipeline::new] {}x{}, arena {} MiB",
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
            hiz: HiZPyramid::new(device, context.width, context.height),
            instance_cull: InstanceCullPass::new(device),
            chunk_expand: ChunkExpandPass::new(device),
            cluster_cull: ClusterCullPass::new(device),
            instance_chunks,
            cluster_chunks,
            draw_commands,
            counter_zero: CounterResetSource::new(device),
            cluster_table: Vec::new(),
            cluster_bounds,
            gbuffer: GBuffer::new(device, context.width, context.height),
            shading: ShadingResolve::new(device, context.surface_format),
            current_region: None,
            frame_visible: Vec::new(),
            occluder_slots: Vec::new(),
            frame_chunks: 0,
            frame_clusters: 0,
            width: context.width,
            height: context.height,
        }
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

    /// Add a model. Drains in-flight frames first so no live region
    /// references stale constants.
    pub fn push_model(&mut self, item: RenderItem) -> EngineResult<ItemIndex> {
        self.flush()?;
        log::debug!(
            "[DeferredPipeline::push_model] '{}' ({} vertices)",
            item.name,
            item.vertices.len()
        );
        let index = self.register_item(item)?;
        self.rebuild_cluster_buffer();
        Ok(index)
    }

    pub fn push_models(&mut self, models: Vec<RenderItem>) -> EngineResult<Vec<ItemIndex>> {
        self.flush()?;
        let indices = models
            .into_iter()
            .map(|m| self.register_item(m))
            .collect::<EngineResult<Vec<_>>>()?;
        self.rebuild_cluster_buffer();
        Ok(indices)
    }

    /// Slot the item's clusters into the bounds table, then admit it into
    /// the store. A rejected item leaves the table untouched.
    fn register_item(&mut self, mut item: RenderItem) -> EngineResult<ItemIndex> {
        item.cluster_base = self.cluster_table.len() as u32;
        let bounds = item.cluster_bounds();
        let index = self.items.try_add(item)?;
        self.cluster_table.extend(bounds.iter().map(|b| ClusterBounds {
            center: [b.center.x, b.center.y, b.center.z],
            _pad0: 0.0,
            extents: [b.extents.x, b.extents.y, b.extents.z],
            _pad1: 0.0,
        }));
        Ok(index)
    }

    fn rebuild_cluster_buffer(&mut self) {
        use wgpu::util::DeviceExt;
        if self.cluster_table.is_empty() {
            return;
        }
        self.cluster_bounds = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Cluster Bounds Table"),
                contents: bytemuck::cast_slice(&self.cluster_table),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            });
    }

    /// Declare this frame's visible set for a layer. The quad-tree or other
    /// scene culling that produces it lives with the caller.
    pub fn push_visible_models(&mut self, layer: RenderLayer, indices: &[ItemIndex]) {
        for &index in indices {
            self.items.add_visible(layer, index);
        }
    }

    /// Build and upload this frame's constants and geometry. Blocks when all
    /// in-flight frames are still on the GPU.
    pub fn update(
        &mut self,
        camera: &mut Camera,
        total_time: f32,
        delta_time: f32,
    ) -> EngineResult<()> {
        // Give completion callbacks a chance to land, then reclaim.
        self.device.poll(wgpu::Maintain::Poll);
        self.arena.reclaim(&self.timeline);

        self.frame_visible.clear();
        for layer in RenderLayer::ALL {
            self.frame_visible
                .extend_from_slice(self.items.visible_items(layer));
        }

        let pass = self.build_pass_constants(camera, total_time, delta_time);
        let region = self.arena.upload_frame(
            &self.queue,
            &self.timeline,
            &self.frame_visible,
            &mut self.items,
            &mut self.materials,
            &pass,
        )?;

        // Packing set per-item geometry offsets; derive the prepass draw
        // list and the dispatch bounds from them.
        self.occluder_slots.clear();
        self.frame_chunks = 0;
        self.frame_clusters = 0;
        let occluders = self.items.visible_items(RenderLayer::Occluder);
        for (slot, &index) in self.frame_visible.iter().enumerate() {
            if let Some(item) = self.items.get(index) {
                let index_count = item.indices.len() as u32;
                self.frame_chunks += chunk_count_for(index_count);
                self.frame_clusters += cluster_count_for(index_count);
                if occluders.contains(&index) {
                    self.occluder_slots.push((
                        slot as u32,
                        index_count,
                        item.start_index,
                        item.base_vertex as i32,
                    ));
                }
            }
        }

        self.current_region = Some(region);
        self.items.clear_visible();
        camera.clear_dirty();
        Ok(())
    }

    /// Record and submit the frame's pass chain, then signal the timeline.
    pub fn draw(&mut self, target: &wgpu::TextureView) -> EngineResult<()> {
        let region = self.current_region.take().ok_or(EngineError::Internal {
            message: "draw called without a prior update".into(),
        })?;
        let object_count = region.sizes.object / crate::upload::frame_packer::OBJECT_STRIDE;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Deferred Frame Encoder"),
            });

        self.hiz.render_occluder_depth(
            &self.device,
            &mut encoder,
            self.arena.buffer(),
            &region,
            &self.occluder_slots,
        );
        self.hiz.build_mip_chain(&mut encoder);

        let instance_group = self.instance_cull.create_bind_group(
            &self.device,
            self.arena.buffer(),
            &region,
            &self.hiz,
            &self.instance_chunks,
        );
        self.instance_cull.execute(
            &mut encoder,
            &instance_group,
            &self.instance_chunks,
            &self.counter_zero,
            object_count as u32,
        );

        let expand_group = self.chunk_expand.create_bind_group(
            &self.device,
            self.arena.buffer(),
            &region,
            &self.instance_chunks,
            &self.cluster_chunks,
        );
        self.chunk_expand.execute(
            &mut encoder,
            &expand_group,
            &self.cluster_chunks,
            &self.counter_zero,
            self.frame_chunks,
        );

        let cluster_group = self.cluster_cull.create_bind_group(
            &self.device,
            self.arena.buffer(),
            &region,
            &self.cluster_chunks,
            &self.hiz,
            &self.draw_commands,
            &self.cluster_bounds,
        );
        self.cluster_cull.execute(
            &mut encoder,
            &cluster_group,
            &self.draw_commands,
            &self.counter_zero,
            self.frame_clusters,
        );

        self.gbuffer.fill(
            &self.device,
            &mut encoder,
            self.arena.buffer(),
            &region,
            &self.draw_commands,
            self.frame_clusters,
        );

        self.resolve(&mut encoder, &region, target);

        self.queue.submit(Some(encoder.finish()));
        let fence = self.timeline.signal();
        self.arena.finish_frame(fence);
        let timeline = self.timeline.clone();
        self.queue.on_submitted_work_done(move || {
            timeline.mark_completed(fence);
        });
        Ok(())
    }

    fn resolve(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        region: &FrameRegionOffsets,
        target: &wgpu::TextureView,
    ) {
        let materials_binding = if region.sizes.material > 0 {
            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: self.arena.buffer(),
                offset: region.material_begin,
                size: wgpu::BufferSize::new(region.sizes.material),
            })
        } else {
            self.shading.fallback_materials.as_entire_binding()
        };

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Deferred Shading Bind Group"),
            layout: &self.shading.layout,
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
                    resource: wgpu::BindingResource::TextureView(self.gbuffer.normal_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(self.gbuffer.position_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: materials_binding,
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Deferred Shading Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.shading.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
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
        let spin = Matrix4::from_angle_y(Rad(total_time * 0.1));
        for (i, base) in BASE_LIGHT_DIRECTIONS.iter().enumerate() {
            let dir = spin * Vector3::from(*base).extend(0.0);
            lights[i] = Light {
                strength: [0.9 - 0.3 * i as f32; 3],
                falloff_start: 1.0,
                direction: [dir.x, dir.y, dir.z],
                falloff_end: 10.0,
                position: [0.0; 3],
                spot_power: 64.0,
            };
        }

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
            object_count: self.frame_visible.len() as u32,
            hiz_mip_count: self.hiz.mip_levels(),
            _pad1: [0; 2],
            lights,
        }
    }

    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.width = width;
        self.height = height;
        self.hiz.resize(&self.device, width, height);
        self.gbuffer.resize(&self.device, width, height);
    }

    /// Wait for every in-flight frame to retire.
    pub fn flush(&mut self) -> EngineResult<()> {
        self.arena.drain(&self.timeline)
    }
}
