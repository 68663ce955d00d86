//! GPU append buffers
//!
//! A fixed-capacity storage buffer of records with a trailing atomic u32
//! counter. Shaders append with `atomicAdd` on the counter; the CPU resets it
//! each frame with a 4-byte copy from a shared zero-source buffer, so no
//! round-trip or extra compute pass is needed.

use std::sync::Arc;

use crate::constants::upload::UPLOAD_ALIGN;

/// Counter offset alignment. Satisfies both `COPY_BUFFER_ALIGNMENT` and
/// storage-binding offset requirements.
pub fn align_for_counter(record_bytes: u64) -> u64 {
    (record_bytes + UPLOAD_ALIGN - 1) / UPLOAD_ALIGN * UPLOAD_ALIGN
}

/// Shared 4-byte zero buffer; one per device, reset source for every counter.
pub struct CounterResetSource {
    buffer: wgpu::Buffer,
}

impl CounterResetSource {
    pub fn new(device: &wgpu::Device) -> Self {
        use wgpu::util::DeviceExt;
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Counter Reset Source"),
            contents: bytemuck::bytes_of(&0u32),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        Self { buffer }
    }
}

pub struct AppendBuffer {
    buffer: wgpu::Buffer,
    capacity: u32,
    record_size: u64,
    counter_offset: u64,
}

impl AppendBuffer {
    pub fn new(
        device: &Arc<wgpu::Device>,
        label: &str,
        capacity: u32,
        record_size: u64,
    ) -> Self {
        let counter_offset = align_for_counter(capacity as u64 * record_size);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: counter_offset + std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            capacity,
            record_size,
            counter_offset,
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn counter_offset(&self) -> u64 {
        self.counter_offset
    }

    /// Record storage as a bind-group resource.
    pub fn records_binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: 0,
            size: wgpu::BufferSize::new(self.counter_offset),
        })
    }

    /// The counter word as a bind-group resource.
    pub fn counter_binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: self.counter_offset,
            size: wgpu::BufferSize::new(std::mem::size_of::<u32>() as u64),
        })
    }

    /// Zero the counter without touching records.
    pub fn reset_counter(&self, encoder: &mut wgpu::CommandEncoder, zero: &CounterResetSource) {
        encoder.copy_buffer_to_buffer(
            &zero.buffer,
            0,
            &self.buffer,
            self.counter_offset,
            std::mem::size_of::<u32>() as u64,
        );
    }
}
