//! Upload ring allocator
//!
//! One fixed-size circular arena carries every per-frame upload: object
//! constants, the material table, pass constants, vertex data and index data.
//! Each frame claims one region of five ordered sub-regions; regions retire in
//! submission order when their fence value completes. The bookkeeping here is
//! pure CPU math, so it is testable without a device — the GPU buffer itself
//! lives with the pipeline.

use std::collections::VecDeque;

use crate::constants::upload::{MAX_FRAMES_IN_FLIGHT, UPLOAD_ALIGN};

/// Fence placeholder for a region that has been placed but not yet submitted.
/// Never reclaimed by `free_completed`.
const FENCE_PENDING: u64 = u64::MAX;

/// Vertex data alignment inside the arena (one vertex stride).
const VERTEX_ALIGN: u64 = 64;
/// Index data alignment (u32 indices).
const INDEX_ALIGN: u64 = 4;

/// Byte sizes of one frame's five sub-regions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameRegionSizes {
    pub object: u64,
    pub material: u64,
    pub pass: u64,
    pub vertex: u64,
    pub index: u64,
}

impl FrameRegionSizes {
    pub fn total(&self) -> u64 {
        self.object + self.material + self.pass + self.vertex + self.index
    }

    fn sub_regions(&self) -> [(u64, u64); 5] {
        [
            (self.object, UPLOAD_ALIGN),
            (self.material, UPLOAD_ALIGN),
            (self.pass, UPLOAD_ALIGN),
            (self.vertex, VERTEX_ALIGN),
            (self.index, INDEX_ALIGN),
        ]
    }

    /// Upper bound on arena bytes this request can consume, including
    /// alignment padding, starting from an aligned cursor.
    fn worst_case(&self) -> u64 {
        self.sub_regions()
            .iter()
            .map(|&(size, align)| align_up(size, align) + align)
            .sum()
    }
}

/// One live frame region: where each sub-region landed, and the fence that
/// retires it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRegionOffsets {
    pub fence: u64,
    pub object_begin: u64,
    pub material_begin: u64,
    pub pass_begin: u64,
    pub vertex_begin: u64,
    pub index_begin: u64,
    /// One past the last byte of the index sub-region; the next frame's
    /// placement cursor.
    pub end: u64,
    pub sizes: FrameRegionSizes,
}

impl FrameRegionOffsets {
    /// The five (begin, size) byte spans, in placement order. Sub-regions
    /// never individually wrap: each either fits before the physical end or
    /// starts at offset 0.
    pub fn sub_spans(&self) -> [(u64, u64); 5] {
        [
            (self.object_begin, self.sizes.object),
            (self.material_begin, self.sizes.material),
            (self.pass_begin, self.sizes.pass),
            (self.vertex_begin, self.sizes.vertex),
            (self.index_begin, self.sizes.index),
        ]
    }
}

/// Why a region could not be placed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingError {
    /// Transient: live regions are in the way, or the in-flight cap is
    /// reached. Freeing completed regions can resolve it.
    Full,
    /// Permanent: the request can never fit, even into an empty arena.
    Exceeded { required: u64, capacity: u64 },
}

/// Circular arena bookkeeping with FIFO reclamation
pub struct UploadRingAllocator {
    capacity: u64,
    live: VecDeque<FrameRegionOffsets>,
    max_in_flight: usize,
}

impl UploadRingAllocator {
    pub fn new(capacity: u64) -> Self {
        Self::with_max_in_flight(capacity, MAX_FRAMES_IN_FLIGHT)
    }

    pub fn with_max_in_flight(capacity: u64, max_in_flight: usize) -> Self {
        assert!(capacity > 0 && max_in_flight > 0);
        Self {
            capacity,
            live: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }

    pub fn oldest_fence(&self) -> Option<u64> {
        self.live.front().map(|r| r.fence)
    }

    pub fn live_regions(&self) -> impl Iterator<Item = &FrameRegionOffsets> {
        self.live.iter()
    }

    /// Place one frame region. Sub-regions go in order object, material,
    /// pass, vertex, index, starting at the previous frame's `end`. A
    /// sub-region that would run past the physical end of the arena wraps to
    /// offset 0; no placement may advance into the oldest live region.
    pub fn request_region(
        &mut self,
        sizes: FrameRegionSizes,
    ) -> Result<FrameRegionOffsets, RingError> {
        if sizes.worst_case() > self.capacity {
            return Err(RingError::Exceeded {
                required: sizes.worst_case(),
                capacity: self.capacity,
            });
        }
        if self.live.len() >= self.max_in_flight {
            log::trace!(
                "[UploadRingAllocator::request_region] in-flight cap reached ({})",
                self.max_in_flight
            );
            return Err(RingError::Full);
        }

        let cursor = self.live.back().map_or(0, |r| r.end);
        // Circular free span from the cursor up to the oldest live region's
        // first byte. Empty ring: the whole arena.
        let budget = match self.live.front() {
            Some(oldest) => {
                (oldest.object_begin + self.capacity - cursor) % self.capacity
            }
            None => self.capacity,
        };

        let mut consumed = 0u64;
        let mut pos = cursor;
        let mut wrapped = false;
        let mut begins = [0u64; 5];

        for (i, (size, align)) in sizes.sub_regions().into_iter().enumerate() {
            let aligned = align_up(pos, align);
            if aligned + size > self.capacity {
                // Skip the tail and restart this sub-region at 0.
                consumed += (self.capacity - pos) + size;
                wrapped = true;
                begins[i] = 0;
                pos = size;
            } else {
                consumed += (aligned - pos) + size;
                begins[i] = aligned;
                pos = aligned + size;
            }
            if consumed > budget {
                log::trace!(
                    "[UploadRingAllocator::request_region] full: consumed {} of {} free bytes",
                    consumed,
                    budget
                );
                return Err(RingError::Full);
            }
        }
        // A wrapped region must stop strictly short of the oldest live
        // region's start; meeting it exactly would leave the cursor inside
        // occupied territory on the next request.
        if wrapped && consumed == budget {
            return Err(RingError::Full);
        }

        let region = FrameRegionOffsets {
            fence: FENCE_PENDING,
            object_begin: begins[0],
            material_begin: begins[1],
            pass_begin: begins[2],
            vertex_begin: begins[3],
            index_begin: begins[4],
            end: pos,
            sizes,
        };
        self.live.push_back(region);
        Ok(region)
    }

    /// Stamp the newest region with the fence value its frame will signal.
    /// Called at submit, after packing.
    pub fn record_fence(&mut self, fence: u64) {
        if let Some(back) = self.live.back_mut() {
            debug_assert_eq!(back.fence, FENCE_PENDING, "fence recorded twice");
            back.fence = fence;
        }
    }

    /// Retire the FIFO prefix whose fences have completed. Returns how many
    /// regions were freed.
    pub fn free_completed(&mut self, completed_fence: u64) -> usize {
        let mut freed = 0;
        while let Some(front) = self.live.front() {
            if front.fence > completed_fence {
                break;
            }
            self.live.pop_front();
            freed += 1;
        }
        if freed > 0 {
            log::trace!(
                "[UploadRingAllocator::free_completed] freed {} region(s) up to fence {}",
                freed,
                completed_fence
            );
        }
        freed
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sizes(object: u64, material: u64, pass: u64, vertex: u64, index: u64) -> FrameRegionSizes {
        FrameRegionSizes {
            object,
            material,
            pass,
            vertex,
            index,
        }
    }

    /// Every live sub-region as a half-open interval.
    fn live_spans(ring: &UploadRingAllocator) -> Vec<(u64, u64)> {
        ring.live_regions()
            .flat_map(|r| r.sub_spans())
            .filter(|&(_, size)| size > 0)
            .map(|(begin, size)| (begin, begin + size))
            .collect()
    }

    fn assert_no_overlap(ring: &UploadRingAllocator) {
        let spans = live_spans(ring);
        for (i, a) in spans.iter().enumerate() {
            assert!(a.1 <= ring.capacity(), "span {:?} crosses physical end", a);
            for b in spans.iter().skip(i + 1) {
                let disjoint = a.1 <= b.0 || b.1 <= a.0;
                assert!(disjoint, "overlapping spans {:?} and {:?}", a, b);
            }
        }
    }

    #[test]
    fn sub_regions_are_placed_in_order_and_aligned() {
        let mut ring = UploadRingAllocator::new(64 * 1024);
        let region = ring.request_region(sizes(512, 256, 256, 1000, 300)).unwrap();

        assert_eq!(region.object_begin, 0);
        assert_eq!(region.material_begin, 512);
        assert_eq!(region.pass_begin, 768);
        assert_eq!(region.vertex_begin, 1024);
        assert_eq!(region.vertex_begin % VERTEX_ALIGN, 0);
        assert_eq!(region.index_begin, 2024);
        assert_eq!(region.end, 2324);
    }

    #[test]
    fn oversized_request_is_permanent() {
        let mut ring = UploadRingAllocator::new(4096);
        let err = ring
            .request_region(sizes(4096, 256, 256, 0, 0))
            .unwrap_err();
        assert!(matches!(err, RingError::Exceeded { .. }));
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn in_flight_cap_forces_full_even_with_space() {
        let mut ring = UploadRingAllocator::with_max_in_flight(1024 * 1024, 2);
        for fence in 1..=2 {
            ring.request_region(sizes(256, 0, 256, 0, 0)).unwrap();
            ring.record_fence(fence);
        }
        assert_eq!(
            ring.request_region(sizes(256, 0, 256, 0, 0)),
            Err(RingError::Full)
        );

        ring.free_completed(1);
        ring.request_region(sizes(256, 0, 256, 0, 0)).unwrap();
    }

    #[test]
    fn fifo_reclamation_pops_completed_prefix_only() {
        let mut ring = UploadRingAllocator::new(1024 * 1024);
        for fence in 1..=4 {
            ring.request_region(sizes(256, 0, 256, 0, 0)).unwrap();
            ring.record_fence(fence);
        }
        assert_eq!(ring.free_completed(2), 2);
        assert_eq!(ring.in_flight(), 2);
        assert_eq!(ring.oldest_fence(), Some(3));
        assert_eq!(ring.free_completed(2), 0);
        assert_eq!(ring.free_completed(10), 2);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn unsubmitted_region_is_never_reclaimed() {
        let mut ring = UploadRingAllocator::new(1024 * 1024);
        ring.request_region(sizes(256, 0, 256, 0, 0)).unwrap();
        assert_eq!(ring.free_completed(u64::MAX - 1), 0);
        assert_eq!(ring.in_flight(), 1);
    }

    #[test]
    fn wrapped_sub_region_stays_below_oldest_object_begin() {
        // Two regions nearly fill the ring; freeing the first leaves a hole
        // at the front that the third frame's tail must wrap into.
        let mut ring = UploadRingAllocator::new(8192);
        ring.request_region(sizes(1024, 256, 256, 1024, 512)).unwrap();
        ring.record_fence(1);
        let second = ring.request_region(sizes(1024, 256, 256, 1024, 512)).unwrap();
        ring.record_fence(2);
        ring.free_completed(1);

        let third = ring.request_region(sizes(1024, 256, 256, 1024, 512)).unwrap();
        ring.record_fence(3);

        let wrapped: Vec<_> = third
            .sub_spans()
            .iter()
            .filter(|&&(begin, size)| size > 0 && begin + size <= second.object_begin)
            .cloned()
            .collect();
        assert!(!wrapped.is_empty(), "expected at least one wrapped sub-region");
        for (begin, size) in wrapped {
            assert!(begin + size < second.object_begin);
        }
        assert_no_overlap(&ring);
    }

    #[test]
    fn randomized_live_regions_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for trial in 0..64 {
            let capacity = 16 * 1024 + rng.gen_range(0..8) * 1024;
            let mut ring = UploadRingAllocator::new(capacity);
            let mut next_fence = 1u64;
            let mut completed = 0u64;

            for _ in 0..400 {
                let request = sizes(
                    rng.gen_range(0..2048),
                    rng.gen_range(0..512),
                    256,
                    rng.gen_range(0..4096),
                    rng.gen_range(0..1024),
                );
                match ring.request_region(request) {
                    Ok(_) => {
                        ring.record_fence(next_fence);
                        next_fence += 1;
                    }
                    Err(RingError::Full) => {
                        // Retire the oldest frame, as the fence wait would.
                        let oldest = ring.oldest_fence().expect("full ring has live regions");
                        completed = completed.max(oldest);
                        assert!(ring.free_completed(completed) > 0, "trial {}", trial);
                    }
                    Err(e @ RingError::Exceeded { .. }) => {
                        panic!("unexpected permanent error: {:?}", e)
                    }
                }
                assert_no_overlap(&ring);
            }
        }
    }

    #[test]
    fn near_capacity_frames_make_progress() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ring = UploadRingAllocator::new(32 * 1024);
        let mut next_fence = 1u64;
        let mut placed = 0;

        for _ in 0..200 {
            // Each frame wants roughly half the arena.
            let request = sizes(
                4096 + rng.gen_range(0..1024),
                512,
                256,
                8192 + rng.gen_range(0..2048),
                2048,
            );
            loop {
                match ring.request_region(request) {
                    Ok(_) => {
                        ring.record_fence(next_fence);
                        next_fence += 1;
                        placed += 1;
                        break;
                    }
                    Err(RingError::Full) => {
                        let oldest = ring.oldest_fence().unwrap();
                        ring.free_completed(oldest);
                    }
                    Err(e) => panic!("{:?}", e),
                }
            }
            assert_no_overlap(&ring);
        }
        assert_eq!(placed, 200);
    }
}
