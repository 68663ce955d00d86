//! CPU reference implementations of the GPU culling math
//!
//! Mirrors the depth-pyramid reduction and the conservative occlusion test so
//! the shader logic has something exact to be checked against. Used by tests
//! and by debug validation; never on the hot path.

use cgmath::{Matrix4, Vector4};

use crate::constants::culling::HIZ_MIN_SIZE;
use crate::scene::Aabb;

/// Mip levels for a pyramid whose coarsest level stays at least
/// `HIZ_MIN_SIZE` texels wide.
pub fn mip_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(HIZ_MIN_SIZE);
    (largest / HIZ_MIN_SIZE).ilog2() + 1
}

/// CPU depth pyramid. Depth is reversed: 1.0 at the near plane, 0.0 at the
/// far plane, so the min of a 2x2 block is its farthest occluder point.
pub struct DepthPyramid {
    levels: Vec<Vec<f32>>,
    dims: Vec<(u32, u32)>,
}

impl DepthPyramid {
    /// Build the full chain from a level-0 depth image (row-major).
    pub fn build(width: u32, height: u32, level0: &[f32]) -> Self {
        assert_eq!(level0.len(), (width * height) as usize);
        let count = mip_count(width, height);

        let mut levels = vec![level0.to_vec()];
        let mut dims = vec![(width, height)];
        for _ in 1..count {
            let (pw, ph) = *dims.last().expect("at least level 0");
            let prev = levels.last().expect("at least level 0");
            let w = (pw / 2).max(1);
            let h = (ph / 2).max(1);
            let mut level = vec![0.0f32; (w * h) as usize];
            for y in 0..h {
                for x in 0..w {
                    // Edge texels of an odd source absorb the leftover
                    // row/column; dropping it could hide a far occludee.
                    let x_end = if x == w - 1 { pw - 1 } else { x * 2 + 1 };
                    let y_end = if y == h - 1 { ph - 1 } else { y * 2 + 1 };
                    let mut m = f32::MAX;
                    for sy in (y * 2)..=y_end {
                        for sx in (x * 2)..=x_end {
                            m = m.min(prev[(sy * pw + sx) as usize]);
                        }
                    }
                    level[(y * w + x) as usize] = m;
                }
            }
            levels.push(level);
            dims.push((w, h));
        }
        Self { levels, dims }
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn dims(&self, level: u32) -> (u32, u32) {
        self.dims[level as usize]
    }

    pub fn sample(&self, level: u32, x: u32, y: u32) -> f32 {
        let (w, h) = self.dims[level as usize];
        let x = x.min(w - 1);
        let y = y.min(h - 1);
        self.levels[level as usize][(y * w + x) as usize]
    }
}

/// CPU mirror of the GPU append protocol: an atomic counter over a
/// fixed-capacity record array. The counter keeps counting past capacity,
/// but records beyond the end are dropped and the consumable length clamps,
/// exactly as the shaders' guarded `atomicAdd` behaves.
pub struct AppendSink<T> {
    records: Vec<T>,
    capacity: usize,
    count: u32,
}

impl<T: Copy> AppendSink<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity,
            count: 0,
        }
    }

    /// The per-frame counter reset, as the 4-byte buffer copy does it.
    pub fn reset(&mut self) {
        self.records.clear();
        self.count = 0;
    }

    pub fn append(&mut self, record: T) {
        let slot = self.count as usize;
        self.count += 1;
        if slot < self.capacity {
            self.records.push(record);
        }
    }

    /// Raw counter value, what an indirect-count draw argument would read.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Records actually present: the counter clamped to capacity.
    pub fn len(&self) -> usize {
        (self.count as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }
}

/// Screen-space footprint of a projected box, in level-0 texel coordinates.
#[derive(Copy, Clone, Debug)]
pub struct ScreenFootprint {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
    /// Largest reversed depth over the corners: the point nearest the camera.
    pub nearest_depth: f32,
}

/// Project a world-space box. `None` when any corner reaches behind the
/// camera; such objects are never occlusion-culled.
pub fn project_aabb(
    bounds: &Aabb,
    view_proj: &Matrix4<f32>,
    viewport: (u32, u32),
) -> Option<ScreenFootprint> {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    let mut nearest = f32::MIN;

    for corner in bounds.corners() {
        let clip = view_proj * Vector4::new(corner.x, corner.y, corner.z, 1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;
        let depth = clip.z / clip.w;

        let sx = (ndc_x * 0.5 + 0.5) * viewport.0 as f32;
        let sy = (0.5 - ndc_y * 0.5) * viewport.1 as f32;
        min_x = min_x.min(sx);
        min_y = min_y.min(sy);
        max_x = max_x.max(sx);
        max_y = max_y.max(sy);
        nearest = nearest.max(depth);
    }

    Some(ScreenFootprint {
        min_x: min_x.max(0.0),
        min_y: min_y.max(0.0),
        max_x: max_x.min(viewport.0 as f32),
        max_y: max_y.min(viewport.1 as f32),
        nearest_depth: nearest,
    })
}

/// Mip level whose texels cover the footprint with a 2x2 sample grid.
pub fn mip_for_footprint(footprint: &ScreenFootprint, level_count: u32) -> u32 {
    let extent = (footprint.max_x - footprint.min_x)
        .max(footprint.max_y - footprint.min_y)
        .max(1.0);
    let level = (extent / 2.0).log2().ceil().max(0.0) as u32;
    level.min(level_count - 1)
}

/// Conservative occlusion test against the pyramid. Returns true only when
/// every sampled texel over the footprint is nearer than the object's nearest
/// point; any tie or partial visibility keeps the object.
pub fn is_occluded(pyramid: &DepthPyramid, footprint: &ScreenFootprint) -> bool {
    if footprint.max_x <= footprint.min_x || footprint.max_y <= footprint.min_y {
        // Off screen entirely; frustum logic owns this case.
        return false;
    }
    let level = mip_for_footprint(footprint, pyramid.level_count());
    let scale = 1u32 << level;
    let (w, h) = pyramid.dims(level);

    let x0 = (footprint.min_x as u32 / scale).min(w - 1);
    let y0 = (footprint.min_y as u32 / scale).min(h - 1);
    let x1 = ((footprint.max_x.ceil() as u32).saturating_sub(1) / scale).min(w - 1);
    let y1 = ((footprint.max_y.ceil() as u32).saturating_sub(1) / scale).min(h - 1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            if footprint.nearest_depth >= pyramid.sample(level, x, y) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    #[test]
    fn mip_count_stops_at_min_size() {
        assert_eq!(mip_count(4, 4), 1);
        assert_eq!(mip_count(8, 8), 2);
        assert_eq!(mip_count(1024, 1024), 9);
        assert_eq!(mip_count(1024, 512), 9);
    }

    #[test]
    fn reduction_keeps_the_farthest_occluder() {
        // 4x4 image, one far hole (0.1) among near values.
        let mut level0 = vec![0.9f32; 16];
        level0[5] = 0.1;
        let pyramid = DepthPyramid::build(4, 4, &level0);

        assert_eq!(pyramid.level_count(), 1);

        let pyramid = DepthPyramid::build(8, 8, &{
            let mut img = vec![0.9f32; 64];
            img[9] = 0.1;
            img
        });
        assert_eq!(pyramid.level_count(), 2);
        // The hole survives into the texel covering it; others stay near.
        assert_eq!(pyramid.sample(1, 0, 0), 0.1);
        assert_eq!(pyramid.sample(1, 1, 1), 0.9);
    }

    #[test]
    fn reduction_absorbs_odd_edges() {
        // 9x9 reduces to 4x4; the leftover row and column fold into the edge
        // texels so a far value there cannot vanish.
        let mut level0 = vec![0.9f32; 81];
        level0[8 * 9 + 8] = 0.05;
        let pyramid = DepthPyramid::build(9, 9, &level0);
        assert_eq!(pyramid.dims(1), (4, 4));
        assert_eq!(pyramid.sample(1, 3, 3), 0.05);
        assert_eq!(pyramid.sample(1, 0, 0), 0.9);
    }

    #[test]
    fn append_counter_resets_and_clamps_at_capacity() {
        let mut sink = AppendSink::new(4);
        for i in 0..6u32 {
            sink.append(i);
        }
        // The counter keeps the true total; only the records clamp.
        assert_eq!(sink.count(), 6);
        assert_eq!(sink.len(), 4);
        assert_eq!(sink.records(), &[0, 1, 2, 3]);

        sink.reset();
        assert_eq!(sink.count(), 0);
        assert!(sink.is_empty());
        assert!(sink.records().is_empty());

        sink.append(9);
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.records(), &[9]);
    }

    fn box_at(z: f32, half: f32) -> Aabb {
        Aabb::new(Vector3::new(0.0, 0.0, z), Vector3::new(half, half, half))
    }

    fn ortho_viewproj() -> Matrix4<f32> {
        // Looking down -z from the origin; reversed depth over [0.1, 100].
        let near = 0.1f32;
        let far = 100.0f32;
        let mut m = Matrix4::from_scale(1.0);
        m.x.x = 1.0 / 10.0;
        m.y.y = 1.0 / 10.0;
        // depth = (far + z) / (far - near): z=-near -> ~1, z=-far -> 0.
        m.z.z = 1.0 / (far - near);
        m.w.z = far / (far - near);
        m.z.w = 0.0;
        m.w.w = 1.0;
        m
    }

    #[test]
    fn fully_occluded_box_is_culled() {
        let view_proj = ortho_viewproj();
        // Occluder fills the screen at depth ~0.95 (near).
        let pyramid = DepthPyramid::build(64, 64, &vec![0.95f32; 64 * 64]);
        // Object far behind it.
        let footprint = project_aabb(&box_at(-90.0, 1.0), &view_proj, (64, 64)).unwrap();
        assert!(footprint.nearest_depth < 0.95);
        assert!(is_occluded(&pyramid, &footprint));
    }

    #[test]
    fn one_percent_visibility_survives() {
        let view_proj = ortho_viewproj();
        // Near occluder everywhere except one far texel: a peephole.
        let mut depth = vec![0.95f32; 64 * 64];
        depth[(32 * 64 + 32) as usize] = 0.01;
        let pyramid = DepthPyramid::build(64, 64, &depth);

        // Large object behind the occluder, covering the peephole.
        let footprint = project_aabb(&box_at(-90.0, 9.0), &view_proj, (64, 64)).unwrap();
        assert!(!is_occluded(&pyramid, &footprint));
    }

    #[test]
    fn object_nearer_than_occluder_survives() {
        let view_proj = ortho_viewproj();
        let pyramid = DepthPyramid::build(64, 64, &vec![0.5f32; 64 * 64]);
        let footprint = project_aabb(&box_at(-5.0, 1.0), &view_proj, (64, 64)).unwrap();
        assert!(footprint.nearest_depth > 0.5);
        assert!(!is_occluded(&pyramid, &footprint));
    }

    #[test]
    fn box_reaching_behind_camera_is_never_culled() {
        use cgmath::EuclideanSpace;
        let camera = crate::camera::Camera::new(1.0);
        let view_proj = camera.build_view_proj();
        let behind = camera.position.to_vec() - camera.view_direction() * 5.0;
        let bounds = Aabb::new(behind, Vector3::new(1.0, 1.0, 1.0));
        assert!(project_aabb(&bounds, &view_proj, (64, 64)).is_none());
    }
}
