//! Instance-level Hi-Z culling pass
//!
//! One thread per visible object: frustum test, then a conservative
//! occlusion test against the depth pyramid. Survivors append one
//! `InstanceChunk` per geometry chunk for the expansion pass.

use std::sync::Arc;

use crate::constants::culling::CULL_WORKGROUP_SIZE;
use crate::culling::append_buffer::{AppendBuffer, CounterResetSource};
use crate::culling::hiz::HiZPyramid;
use crate::upload::frame_packer::PassConstants;
use crate::upload::FrameRegionOffsets;

pub struct InstanceCullPass {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl InstanceCullPass {
    pub fn new(device: &Arc<wgpu::Device>) -> Self {
        // Shared constants are generated from the Rust definitions so the
        // shader can never drift from the CPU-side values.
        let source = format!(
            "{}\n{}",
            crate::constants::gpu_constants_wgsl(),
            include_str!("../shaders/instance_cull.wgsl")
        );
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Instance Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Instance Cull Layout"),
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
                // Depth pyramid
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
                // Surviving chunk records
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
                // Append counter
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
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
            label: Some("Instance Cull Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Instance Cull Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "cull_instances",
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
        hiz: &HiZPyramid,
        out_chunks: &AppendBuffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Instance Cull Bind Group"),
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
                    resource: wgpu::BindingResource::TextureView(hiz.chain_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(hiz.sampler()),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: out_chunks.records_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: out_chunks.counter_binding(),
                },
            ],
        })
    }

    /// Reset the output counter and test every visible object.
    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        out_chunks: &AppendBuffer,
        zero: &CounterResetSource,
        object_count: u32,
    ) {
        out_chunks.reset_counter(encoder, zero);
        if object_count == 0 {
            return;
        }
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Instance Cull Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        let workgroups = (object_count + CULL_WORKGROUP_SIZE - 1) / CULL_WORKGROUP_SIZE;
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
}
