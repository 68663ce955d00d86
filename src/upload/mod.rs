//! Per-frame upload path
//!
//! `UploadRingAllocator` does the byte bookkeeping, `FrameConstantsPacker`
//! serializes frame data, and `FrameArena` owns the single GPU buffer they
//! feed. `acquire_region` is the only place the CPU ever blocks on the GPU:
//! when the ring is full or too many frames are in flight, it waits for the
//! oldest frame's fence and retries.

pub mod frame_packer;
pub mod ring_allocator;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{config_error, EngineError, EngineResult};
use crate::scene::{ItemIndex, ItemStore, MaterialStore};
use crate::sync::GpuTimeline;

pub use frame_packer::{
    ClusterBounds, FrameConstantsPacker, IndirectCommand, InstanceChunk, ClusterChunk,
    MaterialConstants, ObjectConstants, PackedFrame, PassConstants,
};
pub use ring_allocator::{FrameRegionOffsets, FrameRegionSizes, RingError, UploadRingAllocator};

/// Block until a frame region can be placed. Frees whatever the GPU has
/// already retired first; only when that is not enough does it wait on the
/// oldest in-flight fence.
///
/// `pump` runs before each wait. On native wgpu, submitted-work callbacks
/// only fire while the device is polled, so the caller passes a hook that
/// polls; without it the timeline would never advance while we sleep.
pub fn acquire_region(
    ring: &mut UploadRingAllocator,
    timeline: &GpuTimeline,
    sizes: FrameRegionSizes,
    timeout: Option<Duration>,
    mut pump: impl FnMut(),
) -> EngineResult<FrameRegionOffsets> {
    loop {
        match ring.request_region(sizes) {
            Ok(region) => return Ok(region),
            Err(RingError::Exceeded { required, capacity }) => {
                return Err(config_error(format!(
                    "frame needs {} bytes but the upload arena holds {}",
                    required, capacity
                )));
            }
            Err(RingError::Full) => {
                ring.free_completed(timeline.completed());
                if let Ok(region) = ring.request_region(sizes) {
                    return Ok(region);
                }
                let oldest = ring.oldest_fence().ok_or_else(|| EngineError::Internal {
                    message: "upload ring full with no live regions".into(),
                })?;
                log::debug!(
                    "[acquire_region] ring full, waiting for fence {} ({} in flight)",
                    oldest,
                    ring.in_flight()
                );
                pump();
                if timeline.completed() < oldest {
                    timeline.wait_for(oldest, timeout)?;
                }
                ring.free_completed(timeline.completed());
            }
        }
    }
}

/// The GPU-side arena plus its CPU bookkeeping
pub struct FrameArena {
    device: Arc<wgpu::Device>,
    buffer: wgpu::Buffer,
    ring: UploadRingAllocator,
    packer: FrameConstantsPacker,
    /// Bound on each fence wait; `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

impl FrameArena {
    pub fn new(device: &Arc<wgpu::Device>, capacity: u64) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Frame Upload Arena"),
            size: capacity,
            usage: wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        Self {
            device: device.clone(),
            buffer,
            ring: UploadRingAllocator::new(capacity),
            packer: FrameConstantsPacker::new(),
            wait_timeout: Some(Duration::from_secs(2)),
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// Place, pack and flush one frame's data. Blocks on the timeline when
    /// the ring needs draining.
    pub fn upload_frame(
        &mut self,
        queue: &wgpu::Queue,
        timeline: &GpuTimeline,
        visible: &[ItemIndex],
        items: &mut ItemStore,
        materials: &mut MaterialStore,
        pass: &PassConstants,
    ) -> EngineResult<FrameRegionOffsets> {
        let sizes = self.packer.compute_sizes(visible, items, materials);
        let device = self.device.clone();
        let region = acquire_region(&mut self.ring, timeline, sizes, self.wait_timeout, || {
            device.poll(wgpu::Maintain::Wait);
        })?;
        self.packer.pack(visible, items, materials, pass, &region);
        self.packer.flush(queue, &self.buffer, &region);
        Ok(region)
    }

    /// Stamp the newest region with the fence the submitted frame signals.
    pub fn finish_frame(&mut self, fence: u64) {
        self.ring.record_fence(fence);
    }

    /// Drop every region the GPU has finished with.
    pub fn reclaim(&mut self, timeline: &GpuTimeline) {
        self.ring.free_completed(timeline.completed());
    }

    /// Wait for every in-flight frame to retire. Polls the device so each
    /// frame's completion callback can land.
    pub fn drain(&mut self, timeline: &GpuTimeline) -> EngineResult<()> {
        while let Some(oldest) = self.ring.oldest_fence() {
            self.device.poll(wgpu::Maintain::Wait);
            if timeline.completed() < oldest {
                timeline.wait_for(oldest, self.wait_timeout)?;
            }
            self.ring.free_completed(timeline.completed());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn frame_sizes(bytes: u64) -> FrameRegionSizes {
        FrameRegionSizes {
            object: bytes,
            material: 0,
            pass: 256,
            vertex: 0,
            index: 0,
        }
    }

    #[test]
    fn acquire_blocks_until_oldest_frame_retires() {
        // Arena fits two frames; the third must wait for fence 1.
        let mut ring = UploadRingAllocator::new(3072);
        let timeline = GpuTimeline::new();

        for _ in 0..2 {
            let fence = timeline.signal();
            acquire_region(&mut ring, &timeline, frame_sizes(1024), None, || {}).unwrap();
            ring.record_fence(fence);
        }

        let gpu = {
            let timeline = timeline.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                timeline.mark_completed(1);
            })
        };

        let start = Instant::now();
        let region = acquire_region(
            &mut ring,
            &timeline,
            frame_sizes(768),
            Some(Duration::from_secs(5)),
            || {},
        )
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        // The freed first frame's bytes are reusable now.
        assert_eq!(region.object_begin, 0);
        gpu.join().unwrap();
    }

    #[test]
    fn acquire_times_out_on_a_stuck_gpu() {
        let mut ring = UploadRingAllocator::new(3072);
        let timeline = GpuTimeline::new();
        let sizes = frame_sizes(1024);

        for _ in 0..2 {
            let fence = timeline.signal();
            acquire_region(&mut ring, &timeline, sizes, None, || {}).unwrap();
            ring.record_fence(fence);
        }

        let err = acquire_region(
            &mut ring,
            &timeline,
            sizes,
            Some(Duration::from_millis(20)),
            || {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::FenceTimeout { value: 1, .. }));
    }

    #[test]
    fn degenerate_frame_fails_fast() {
        let mut ring = UploadRingAllocator::new(1024);
        let timeline = GpuTimeline::new();
        let err =
            acquire_region(&mut ring, &timeline, frame_sizes(4096), None, || {}).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration { .. }));
    }

    #[test]
    fn blocked_acquire_reaches_completions_through_the_pump() {
        // No other thread marks the fence: the only way it can complete is
        // the pump hook, standing in for the device poll that fires
        // submitted-work callbacks on native.
        let mut ring = UploadRingAllocator::new(3072);
        let timeline = GpuTimeline::new();

        for _ in 0..2 {
            let fence = timeline.signal();
            acquire_region(&mut ring, &timeline, frame_sizes(1024), None, || {}).unwrap();
            ring.record_fence(fence);
        }

        let hook = timeline.clone();
        let region = acquire_region(
            &mut ring,
            &timeline,
            frame_sizes(768),
            Some(Duration::from_millis(100)),
            || hook.mark_completed(1),
        )
        .unwrap();
        assert_eq!(region.object_begin, 0);
    }

    #[test]
    fn completed_fences_free_without_waiting() {
        let mut ring = UploadRingAllocator::new(3072);
        let timeline = GpuTimeline::new();
        let sizes = frame_sizes(1024);

        for _ in 0..2 {
            let fence = timeline.signal();
            acquire_region(&mut ring, &timeline, sizes, None, || {}).unwrap();
            ring.record_fence(fence);
        }
        timeline.mark_completed(2);

        // No wait needed: free_completed alone makes room.
        let start = Instant::now();
        acquire_region(&mut ring, &timeline, sizes, Some(Duration::from_secs(5)), || {}).unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
        assert_eq!(ring.in_flight(), 1);
    }
}
