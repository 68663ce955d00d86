//! Cluster-level Hi-Z culling pass
//!
//! The last compute stage: every surviving cluster is re-tested with its own
//! bounds from the per-cluster table, and survivors write final indirect
//! draw commands. The
//! command buffer's append counter doubles as the count argument for
//! `multi_draw_indexed_indirect_count`, so the frame never reads culling
//! results back.

use std::sync::Arc;

use crate::constants::culling::CULL_WORKGROUP_SIZE;
use crate::culling::append_buffer::{AppendBuffer, CounterResetSource};
use crate::culling::hiz::HiZPyramid;
use crate::upload::frame_packer::PassConstants;
use crate::upload::FrameRegionOffsets;

pub struct ClusterCullPass {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ClusterCullPass {
    pub fn new(device: &Arc<wgpu::Device>) -> Self {
        // Shared constants are generated from the Rust definitions so the
        // shader can never drift from the CPU-side values.
        let source = format!(
            "{}\n{}",
            crate::constants::gpu_constants_wgsl(),
            include_str!("../shaders/cluster_cull.wgsl")
        );
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Cluster Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cluster Cull Layout"),
            entries: &[
                // Pass constants
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
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
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Cluster records
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Cluster count
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Depth pyramid
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
                // Indirect commands out
                wgpu::BindGroupLayoutEntry {
                    binding: 6,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Draw count
                wgpu::BindGroupLayoutEntry {
                    binding: 7,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Per-cluster bounds table
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
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
            label: Some("Cluster Cull Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Cluster Cull Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "cull_clusters",
        });

        Self {
            pipeline,
            bind_group_layout,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_bind_group(
        &self,
        device: &wgpu::Device,
        arena: &wgpu::Buffer,
        region: &FrameRegionOffsets,
        in_clusters: &AppendBuffer,
        hiz: &HiZPyramid,
        out_commands: &AppendBuffer,
        cluster_bounds: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cluster Cull Bind Group"),
            layout: &self.bind_group_layout,
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
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: in_clusters.records_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: in_clusters.counter_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(hiz.chain_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(hiz.sampler()),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: out_commands.records_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: out_commands.counter_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: cluster_bounds.as_entire_binding(),
                },
            ],
        })
    }

    /// Reset the draw count, then test every possible cluster. `max_clusters`
    /// bounds the expansion pass's output.
    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        out_commands: &AppendBuffer,
        zero: &CounterResetSource,
        max_clusters: u32,
    ) {
        out_commands.reset_counter(encoder, zero);
        if max_clusters == 0 {
            return;
        }
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Cluster Cull Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        let workgroups = (max_clusters + CULL_WORKGROUP_SIZE - 1) / CULL_WORKGROUP_SIZE;
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
}
