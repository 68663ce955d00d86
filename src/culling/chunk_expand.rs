//! Chunk expansion pass
//!
//! Fans each surviving `InstanceChunk` out into its clusters. The input count
//! is read on the GPU from the instance pass's append counter, so no CPU
//! round-trip sits between the two passes; the dispatch covers the worst
//! case and idle threads exit early.

use std::sync::Arc;

use crate::constants::culling::CULL_WORKGROUP_SIZE;
use crate::culling::append_buffer::{AppendBuffer, CounterResetSource};
use crate::upload::FrameRegionOffsets;

pub struct ChunkExpandPass {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ChunkExpandPass {
    pub fn new(device: &Arc<wgpu::Device>) -> Self {
        // Shared constants are generated from the Rust definitions so the
        // shader can never drift from the CPU-side values.
        let source = format!(
            "{}\n{}",
            crate::constants::gpu_constants_wgsl(),
            include_str!("../shaders/chunk_expand.wgsl")
        );
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Chunk Expand Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Chunk Expand Layout"),
            entries: &[
                // Object constants
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Surviving chunks
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
                // Surviving chunk count
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
                // Cluster records out
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Cluster counter
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Chunk Expand Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Chunk Expand Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "expand_chunks",
        });

        Self {
            pipeline,
            bind_group_layout,
        }
    }

    pub fn create_bind_group(
        &self,
        device: &wgpu::Device,
        arena: &wgpu::Buffer,
        region: &FrameRegionOffsets,
        in_chunks: &AppendBuffer,
        out_clusters: &AppendBuffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Chunk Expand Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: arena,
                        offset: region.object_begin,
                        size: wgpu::BufferSize::new(region.sizes.object),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: in_chunks.records_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: in_chunks.counter_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out_clusters.records_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: out_clusters.counter_binding(),
                },
            ],
        })
    }

    /// Reset the cluster counter, then expand. `max_chunks` is the CPU-known
    /// upper bound on the instance pass's output (the sum of every visible
    /// object's chunk count).
    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        out_clusters: &AppendBuffer,
        zero: &CounterResetSource,
        max_chunks: u32,
    ) {
        out_clusters.reset_counter(encoder, zero);
        if max_chunks == 0 {
            return;
        }
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Chunk Expand Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        let workgroups = (max_chunks + CULL_WORKGROUP_SIZE - 1) / CULL_WORKGROUP_SIZE;
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
}
