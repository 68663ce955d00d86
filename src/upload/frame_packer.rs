//! Frame constants packer
//!
//! Serializes one frame's object constants, material table, pass constants
//! and geometry into CPU scratch at the layout the ring region dictates. The
//! caller flushes each sub-region into the GPU arena with
//! `queue.write_buffer`, so packing stays device-free and unit-testable.

use bytemuck::{Pod, Zeroable};
use cgmath::{Matrix4, SquareMatrix};

use crate::constants::scene::{chunk_count_for, MAX_LIGHTS};
use crate::constants::upload::UPLOAD_ALIGN;
use crate::scene::{ItemIndex, ItemStore, MaterialStore, Vertex};
use crate::upload::ring_allocator::{FrameRegionOffsets, FrameRegionSizes};

/// Indirect draw arguments, laid out exactly as
/// `multi_draw_indexed_indirect` consumes them. `first_instance` carries the
/// object slot so shaders can index the object-constant table per draw.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

/// Culling intermediate: one object surviving instance culling, one entry per
/// geometry chunk.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct InstanceChunk {
    pub instance_id: u32,
    pub chunk_id: u32,
}

/// Culling intermediate: one cluster of one surviving chunk.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClusterChunk {
    pub instance_id: u32,
    pub cluster_id: u32,
}

/// Per-object constants, one aligned slot per visible item. The embedded draw
/// command is the template the cluster-culling pass refines into final
/// indirect commands.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ObjectConstants {
    pub world: [[f32; 4]; 4],
    pub tex_transform: [[f32; 4]; 4],
    pub bounds_center: [f32; 3],
    pub _pad0: f32,
    pub bounds_extents: [f32; 3],
    pub material_index: u32,
    pub draw: IndirectCommand,
    pub chunk_count: u32,
    /// First entry for this item in the per-cluster bounds table.
    pub cluster_base: u32,
    /// Pads the slot to the 256-byte arena stride so the WGSL storage array
    /// indexes it directly.
    pub _pad1: [u32; 17],
}

/// One entry of the per-cluster bounds table, in item-local space. The
/// cluster-culling pass transforms these by the object's world matrix to get
/// a tighter box than the whole item's.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct ClusterBounds {
    pub center: [f32; 3],
    pub _pad0: f32,
    pub extents: [f32; 3],
    pub _pad1: f32,
}

/// Material table entry
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MaterialConstants {
    pub diffuse_albedo: [f32; 4],
    pub fresnel_r0: [f32; 3],
    pub roughness: f32,
    pub transform: [[f32; 4]; 4],
    pub diffuse_map_index: u32,
    pub normal_map_index: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct Light {
    pub strength: [f32; 3],
    pub falloff_start: f32,
    pub direction: [f32; 3],
    pub falloff_end: f32,
    pub position: [f32; 3],
    pub spot_power: f32,
}

/// Whole-frame constants: camera matrices, frustum, timing, lighting.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PassConstants {
    pub view: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub inv_proj: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub inv_view_proj: [[f32; 4]; 4],
    pub frustum_planes: [[f32; 4]; 6],
    pub eye_pos: [f32; 3],
    pub _pad0: f32,
    pub render_target_size: [f32; 2],
    pub inv_render_target_size: [f32; 2],
    pub near_z: f32,
    pub far_z: f32,
    pub total_time: f32,
    pub delta_time: f32,
    pub ambient_light: [f32; 4],
    pub object_count: u32,
    pub hiz_mip_count: u32,
    pub _pad1: [u32; 2],
    pub lights: [Light; MAX_LIGHTS],
}

impl Default for PassConstants {
    fn default() -> Self {
        let identity: [[f32; 4]; 4] = Matrix4::identity().into();
        Self {
            view: identity,
            inv_view: identity,
            proj: identity,
            inv_proj: identity,
            view_proj: identity,
            inv_view_proj: identity,
            frustum_planes: [[0.0; 4]; 6],
            eye_pos: [0.0; 3],
            _pad0: 0.0,
            render_target_size: [0.0; 2],
            inv_render_target_size: [0.0; 2],
            near_z: 0.0,
            far_z: 0.0,
            total_time: 0.0,
            delta_time: 0.0,
            ambient_light: [0.0; 4],
            object_count: 0,
            hiz_mip_count: 0,
            _pad1: [0; 2],
            lights: [Light::default(); MAX_LIGHTS],
        }
    }
}

/// Object-constant slot stride: one 256-byte aligned slot per item.
pub const OBJECT_STRIDE: u64 = next_multiple(std::mem::size_of::<ObjectConstants>() as u64, UPLOAD_ALIGN);
/// Material table entries pack tightly in a storage buffer.
pub const MATERIAL_STRIDE: u64 = std::mem::size_of::<MaterialConstants>() as u64;
/// Pass block size, padded to uniform-binding alignment.
pub const PASS_SIZE: u64 = next_multiple(std::mem::size_of::<PassConstants>() as u64, UPLOAD_ALIGN);
pub const VERTEX_STRIDE: u64 = std::mem::size_of::<Vertex>() as u64;
pub const INDEX_STRIDE: u64 = std::mem::size_of::<u32>() as u64;

const fn next_multiple(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// One packed frame, each sub-region as flat bytes at region-relative
/// offsets. Buffers are owned by the packer and reused across frames.
#[derive(Default)]
pub struct PackedFrame {
    pub object: Vec<u8>,
    pub material: Vec<u8>,
    pub pass: Vec<u8>,
    pub vertex: Vec<u8>,
    pub index: Vec<u8>,
}

#[derive(Default)]
pub struct FrameConstantsPacker {
    scratch: PackedFrame,
    /// Serialized material table, rebuilt only while entries are dirty.
    material_cache: Vec<u8>,
}

impl FrameConstantsPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte cost of one frame holding `visible` items plus the material
    /// table and one pass block. With nothing visible only the pass block
    /// (and any material table) remains.
    pub fn compute_sizes(
        &self,
        visible: &[ItemIndex],
        items: &ItemStore,
        materials: &MaterialStore,
    ) -> FrameRegionSizes {
        let mut vertex = 0u64;
        let mut index = 0u64;
        for &idx in visible {
            if let Some(item) = items.get(idx) {
                vertex += item.vertices.len() as u64 * VERTEX_STRIDE;
                index += item.indices.len() as u64 * INDEX_STRIDE;
            }
        }
        FrameRegionSizes {
            object: visible.len() as u64 * OBJECT_STRIDE,
            material: materials.len() as u64 * MATERIAL_STRIDE,
            pass: PASS_SIZE,
            vertex,
            index,
        }
    }

    /// Serialize the frame. Items get their region-relative `base_vertex` /
    /// `start_index` recorded; the embedded draw template points at them.
    pub fn pack(
        &mut self,
        visible: &[ItemIndex],
        items: &mut ItemStore,
        materials: &mut MaterialStore,
        pass: &PassConstants,
        region: &FrameRegionOffsets,
    ) -> &PackedFrame {
        debug_assert_eq!(region.sizes.object, visible.len() as u64 * OBJECT_STRIDE);

        // Refresh before borrowing scratch; the cache is a sibling field.
        self.refresh_material_cache(materials);

        let s = &mut self.scratch;
        s.object.clear();
        s.object.resize(region.sizes.object as usize, 0);
        s.vertex.clear();
        s.index.clear();

        for (slot, &idx) in visible.iter().enumerate() {
            let item = match items.get_mut(idx) {
                Some(item) => item,
                None => continue,
            };
            item.base_vertex = (s.vertex.len() as u64 / VERTEX_STRIDE) as u32;
            item.start_index = (s.index.len() as u64 / INDEX_STRIDE) as u32;
            s.vertex.extend_from_slice(bytemuck::cast_slice(&item.vertices));
            s.index.extend_from_slice(bytemuck::cast_slice(&item.indices));
            if item.num_frames_dirty > 0 {
                item.num_frames_dirty -= 1;
            }

            let bounds = item.world_bounds();
            let chunk_count = chunk_count_for(item.indices.len() as u32);
            let cluster_base = item.cluster_base;
            let constants = ObjectConstants {
                world: item.world.into(),
                tex_transform: item.tex_transform.into(),
                bounds_center: bounds.center.into(),
                _pad0: 0.0,
                bounds_extents: bounds.extents.into(),
                material_index: item.material.0,
                draw: IndirectCommand {
                    index_count: item.indices.len() as u32,
                    instance_count: 1,
                    first_index: item.start_index,
                    base_vertex: item.base_vertex as i32,
                    first_instance: slot as u32,
                },
                chunk_count,
                cluster_base,
                _pad1: [0; 17],
            };
            let at = slot * OBJECT_STRIDE as usize;
            s.object[at..at + std::mem::size_of::<ObjectConstants>()]
                .copy_from_slice(bytemuck::bytes_of(&constants));
        }

        s.material.clear();
        s.material.extend_from_slice(&self.material_cache);

        s.pass.clear();
        s.pass.resize(PASS_SIZE as usize, 0);
        s.pass[..std::mem::size_of::<PassConstants>()]
            .copy_from_slice(bytemuck::bytes_of(pass));

        &self.scratch
    }

    /// Re-serialize the material table only while some entry is dirty; clean
    /// frames reuse the cached bytes.
    fn refresh_material_cache(&mut self, materials: &mut MaterialStore) {
        if !materials.any_dirty() && self.material_cache.len() as u64
            == materials.len() as u64 * MATERIAL_STRIDE
        {
            return;
        }
        self.material_cache.clear();
        for material in materials.iter_mut() {
            let constants = MaterialConstants {
                diffuse_albedo: material.diffuse_albedo,
                fresnel_r0: material.fresnel_r0,
                roughness: material.roughness,
                transform: material.transform.into(),
                diffuse_map_index: material.diffuse_map_index,
                normal_map_index: material.normal_map_index,
                _pad: [0; 2],
            };
            self.material_cache
                .extend_from_slice(bytemuck::bytes_of(&constants));
            if material.num_frames_dirty > 0 {
                material.num_frames_dirty -= 1;
            }
        }
    }

    /// Flush every non-empty sub-region into the GPU arena.
    pub fn flush(
        &self,
        queue: &wgpu::Queue,
        arena: &wgpu::Buffer,
        region: &FrameRegionOffsets,
    ) {
        let s = &self.scratch;
        for (offset, bytes) in [
            (region.object_begin, &s.object),
            (region.material_begin, &s.material),
            (region.pass_begin, &s.pass),
            (region.vertex_begin, &s.vertex),
            (region.index_begin, &s.index),
        ] {
            if !bytes.is_empty() {
                queue.write_buffer(arena, offset, bytes);
            }
        }
    }
}

const _: () = {
    assert!(std::mem::size_of::<ObjectConstants>() == 256);
    assert!(std::mem::size_of::<MaterialConstants>() % 16 == 0);
    assert!(std::mem::size_of::<PassConstants>() % 16 == 0);
    assert!(std::mem::size_of::<IndirectCommand>() == 20);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Material, MaterialIndex, RenderItem};
    use crate::upload::ring_allocator::UploadRingAllocator;

    fn tri(n: usize) -> (Vec<Vertex>, Vec<u32>) {
        let vertices = (0..n)
            .map(|i| {
                Vertex::new(
                    [i as f32, 0.0, 0.0],
                    [0.0, 1.0, 0.0],
                    [1.0, 0.0, 0.0],
                    [0.0, 0.0],
                )
            })
            .collect();
        let indices = (0..n as u32).collect();
        (vertices, indices)
    }

    fn scene_with(counts: &[usize]) -> (ItemStore, MaterialStore, Vec<ItemIndex>) {
        let mut materials = MaterialStore::new();
        let mat = materials.insert(Material::new("stone"));
        let mut items = ItemStore::new();
        let mut visible = Vec::new();
        for (i, &n) in counts.iter().enumerate() {
            let (v, ix) = tri(n);
            visible.push(items.add(RenderItem::new(format!("item{i}"), v, ix, mat)));
        }
        (items, materials, visible)
    }

    #[test]
    fn sizes_count_every_sub_region() {
        let (items, materials, visible) = scene_with(&[3, 6]);
        let packer = FrameConstantsPacker::new();
        let sizes = packer.compute_sizes(&visible, &items, &materials);

        assert_eq!(sizes.object, 2 * OBJECT_STRIDE);
        assert_eq!(sizes.material, MATERIAL_STRIDE);
        assert_eq!(sizes.pass, PASS_SIZE);
        assert_eq!(sizes.vertex, 9 * VERTEX_STRIDE);
        assert_eq!(sizes.index, 9 * INDEX_STRIDE);
    }

    #[test]
    fn empty_frame_is_pass_only() {
        let items = ItemStore::new();
        let materials = MaterialStore::new();
        let packer = FrameConstantsPacker::new();
        let sizes = packer.compute_sizes(&[], &items, &materials);

        assert_eq!(sizes.object, 0);
        assert_eq!(sizes.material, 0);
        assert_eq!(sizes.vertex, 0);
        assert_eq!(sizes.index, 0);
        assert_eq!(sizes.pass, PASS_SIZE);
        assert_eq!(sizes.total(), PASS_SIZE);
    }

    #[test]
    fn pack_records_region_relative_geometry_offsets() {
        let (mut items, mut materials, visible) = scene_with(&[3, 6, 3]);
        let mut packer = FrameConstantsPacker::new();
        let sizes = packer.compute_sizes(&visible, &items, &materials);
        let mut ring = UploadRingAllocator::new(1024 * 1024);
        let region = ring.request_region(sizes).unwrap();

        let packed = packer.pack(
            &visible,
            &mut items,
            &mut materials,
            &PassConstants::default(),
            &region,
        );
        assert_eq!(packed.object.len() as u64, 3 * OBJECT_STRIDE);
        assert_eq!(packed.vertex.len() as u64, 12 * VERTEX_STRIDE);
        assert_eq!(packed.index.len() as u64, 12 * INDEX_STRIDE);

        let second = items.get(visible[1]).unwrap();
        assert_eq!(second.base_vertex, 3);
        assert_eq!(second.start_index, 3);
        let third = items.get(visible[2]).unwrap();
        assert_eq!(third.base_vertex, 9);
        assert_eq!(third.start_index, 9);

        // Object slot 1 carries a draw template pointing at its geometry.
        let at = OBJECT_STRIDE as usize;
        let constants: &ObjectConstants = bytemuck::from_bytes(
            &packed.object[at..at + std::mem::size_of::<ObjectConstants>()],
        );
        assert_eq!(constants.draw.index_count, 6);
        assert_eq!(constants.draw.first_index, 3);
        assert_eq!(constants.draw.base_vertex, 3);
        assert_eq!(constants.draw.first_instance, 1);
        assert_eq!(constants.draw.instance_count, 1);
    }

    #[test]
    fn clean_materials_reuse_cached_bytes() {
        let (mut items, mut materials, visible) = scene_with(&[3]);
        let mut packer = FrameConstantsPacker::new();
        let sizes = packer.compute_sizes(&visible, &items, &materials);
        let mut ring = UploadRingAllocator::new(1024 * 1024);
        let region = ring.request_region(sizes).unwrap();
        let pass = PassConstants::default();

        packer.pack(&visible, &mut items, &mut materials, &pass, &region);
        for m in materials.iter_mut() {
            m.num_frames_dirty = 0;
        }
        // Mutate without marking dirty: the cache must win.
        materials.get_mut(MaterialIndex(0)).unwrap().roughness = 0.99;
        let packed = packer.pack(&visible, &mut items, &mut materials, &pass, &region);
        let constants: &MaterialConstants =
            bytemuck::from_bytes(&packed.material[..std::mem::size_of::<MaterialConstants>()]);
        assert_eq!(constants.roughness, 0.5);

        // Marking dirty refreshes it.
        materials.get_mut(MaterialIndex(0)).unwrap().mark_dirty();
        let packed = packer.pack(&visible, &mut items, &mut materials, &pass, &region);
        let constants: &MaterialConstants =
            bytemuck::from_bytes(&packed.material[..std::mem::size_of::<MaterialConstants>()]);
        assert_eq!(constants.roughness, 0.99);
    }

    #[test]
    fn item_dirty_counts_drain_per_pack() {
        let (mut items, mut materials, visible) = scene_with(&[3]);
        let mut packer = FrameConstantsPacker::new();
        let sizes = packer.compute_sizes(&visible, &items, &materials);
        let mut ring = UploadRingAllocator::new(1024 * 1024);
        let region = ring.request_region(sizes).unwrap();
        let pass = PassConstants::default();

        let before = items.get(visible[0]).unwrap().num_frames_dirty;
        packer.pack(&visible, &mut items, &mut materials, &pass, &region);
        assert_eq!(items.get(visible[0]).unwrap().num_frames_dirty, before - 1);
    }

}
