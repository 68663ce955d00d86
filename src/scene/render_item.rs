//! Render items and the dense item store

use bytemuck::{Pod, Zeroable};
use cgmath::{Matrix4, SquareMatrix, Vector3, Vector4};

use crate::constants::culling::VERTICES_PER_CLUSTER;
use crate::constants::scene::{chunk_count_for, MAX_INSTANCE_CHUNKS, MAX_OBJECTS_PER_SCENE};
use crate::constants::upload::MAX_FRAMES_IN_FLIGHT;
use crate::error::{config_error, EngineResult};
use crate::scene::MaterialIndex;

/// Mesh vertex layout shared by every pipeline
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub normal: [f32; 3],
    pub _pad1: f32,
    pub tangent: [f32; 3],
    pub _pad2: f32,
    pub uv: [f32; 2],
    pub _pad3: [f32; 2],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], tangent: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            _pad0: 0.0,
            normal,
            _pad1: 0.0,
            tangent,
            _pad2: 0.0,
            uv,
            _pad3: [0.0; 2],
        }
    }
}

/// Axis-aligned bounding box in object space
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub center: Vector3<f32>,
    pub extents: Vector3<f32>,
}

impl Aabb {
    pub fn new(center: Vector3<f32>, extents: Vector3<f32>) -> Self {
        Self { center, extents }
    }

    /// Smallest box containing a vertex list. Empty input collapses to the
    /// origin.
    pub fn from_vertices(vertices: &[Vertex]) -> Self {
        if vertices.is_empty() {
            return Self::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0));
        }
        let mut min = Vector3::new(f32::MAX, f32::MAX, f32::MAX);
        let mut max = Vector3::new(f32::MIN, f32::MIN, f32::MIN);
        for v in vertices {
            min.x = min.x.min(v.position[0]);
            min.y = min.y.min(v.position[1]);
            min.z = min.z.min(v.position[2]);
            max.x = max.x.max(v.position[0]);
            max.y = max.y.max(v.position[1]);
            max.z = max.z.max(v.position[2]);
        }
        Self {
            center: (min + max) * 0.5,
            extents: (max - min) * 0.5,
        }
    }

    pub fn corners(&self) -> [Vector3<f32>; 8] {
        let c = self.center;
        let e = self.extents;
        let mut out = [c; 8];
        for (i, corner) in out.iter_mut().enumerate() {
            corner.x = c.x + if i & 1 == 0 { -e.x } else { e.x };
            corner.y = c.y + if i & 2 == 0 { -e.y } else { e.y };
            corner.z = c.z + if i & 4 == 0 { -e.z } else { e.z };
        }
        out
    }

    /// Transform by an affine matrix, producing the enclosing world-space box.
    pub fn transformed(&self, world: &Matrix4<f32>) -> Self {
        let mut min = Vector3::new(f32::MAX, f32::MAX, f32::MAX);
        let mut max = Vector3::new(f32::MIN, f32::MIN, f32::MIN);
        for corner in self.corners() {
            let p = world * Vector4::new(corner.x, corner.y, corner.z, 1.0);
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Self {
            center: (min + max) * 0.5,
            extents: (max - min) * 0.5,
        }
    }
}

/// Draw ordering buckets. Occluders additionally feed the depth pyramid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RenderLayer {
    Opaque,
    Occluder,
    Transparent,
    Sky,
}

impl RenderLayer {
    pub const ALL: [RenderLayer; 4] = [
        RenderLayer::Opaque,
        RenderLayer::Occluder,
        RenderLayer::Transparent,
        RenderLayer::Sky,
    ];

    fn slot(self) -> usize {
        match self {
            RenderLayer::Opaque => 0,
            RenderLayer::Occluder => 1,
            RenderLayer::Transparent => 2,
            RenderLayer::Sky => 3,
        }
    }
}

/// One drawable object
pub struct RenderItem {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,

    pub world: Matrix4<f32>,
    pub tex_transform: Matrix4<f32>,
    pub bounds: Aabb,
    pub material: MaterialIndex,

    /// Remaining uploads before every in-flight frame sees current constants.
    pub num_frames_dirty: usize,

    /// First entry for this item in the pipeline's cluster-bounds table,
    /// assigned when the item is registered.
    pub cluster_base: u32,

    /// Arena placement for the current frame, written by the packer.
    pub base_vertex: u32,
    pub start_index: u32,
}

impl RenderItem {
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        material: MaterialIndex,
    ) -> Self {
        let bounds = Aabb::from_vertices(&vertices);
        Self {
            name: name.into(),
            vertices,
            indices,
            world: Matrix4::identity(),
            tex_transform: Matrix4::identity(),
            bounds,
            material,
            num_frames_dirty: MAX_FRAMES_IN_FLIGHT,
            cluster_base: 0,
            base_vertex: 0,
            start_index: 0,
        }
    }

    pub fn with_world(mut self, world: Matrix4<f32>) -> Self {
        self.world = world;
        self
    }

    pub fn world_bounds(&self) -> Aabb {
        self.bounds.transformed(&self.world)
    }

    /// Local-space bounds of every cluster: consecutive runs of
    /// `VERTICES_PER_CLUSTER` indices. A cluster referencing no vertices
    /// falls back to the whole item's bounds so it can never test tighter
    /// than the geometry it stands for.
    pub fn cluster_bounds(&self) -> Vec<Aabb> {
        let per = VERTICES_PER_CLUSTER as usize;
        let count = (self.indices.len().max(1) + per - 1) / per;
        let mut out = Vec::with_capacity(count);
        for cluster in 0..count {
            let start = cluster * per;
            let end = (start + per).min(self.indices.len());
            let mut min = Vector3::new(f32::MAX, f32::MAX, f32::MAX);
            let mut max = Vector3::new(f32::MIN, f32::MIN, f32::MIN);
            for &ix in &self.indices[start..end] {
                if let Some(v) = self.vertices.get(ix as usize) {
                    min.x = min.x.min(v.position[0]);
                    min.y = min.y.min(v.position[1]);
                    min.z = min.z.min(v.position[2]);
                    max.x = max.x.max(v.position[0]);
                    max.y = max.y.max(v.position[1]);
                    max.z = max.z.max(v.position[2]);
                }
            }
            if min.x > max.x {
                out.push(self.bounds);
            } else {
                out.push(Aabb {
                    center: (min + max) * 0.5,
                    extents: (max - min) * 0.5,
                });
            }
        }
        out
    }

    pub fn mark_dirty(&mut self) {
        self.num_frames_dirty = MAX_FRAMES_IN_FLIGHT;
    }
}

/// Stable handle into an `ItemStore`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemIndex(pub u32);

/// Dense item storage plus per-layer visible lists
#[derive(Default)]
pub struct ItemStore {
    items: Vec<RenderItem>,
    visible: [Vec<ItemIndex>; 4],
    /// Culling chunks consumed so far, against `MAX_INSTANCE_CHUNKS`.
    total_chunks: u32,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: RenderItem) -> ItemIndex {
        self.total_chunks += chunk_count_for(item.indices.len() as u32);
        let index = ItemIndex(self.items.len() as u32);
        self.items.push(item);
        index
    }

    /// Add an item, rejecting scenes the culling buffers cannot hold. The
    /// append buffers are sized for `MAX_OBJECTS_PER_SCENE` objects and
    /// `MAX_INSTANCE_CHUNKS` chunks; past either bound the GPU would drop
    /// records instead of drawing them.
    pub fn try_add(&mut self, item: RenderItem) -> EngineResult<ItemIndex> {
        if self.items.len() as u32 >= MAX_OBJECTS_PER_SCENE {
            return Err(config_error(format!(
                "scene already holds the maximum of {} objects",
                MAX_OBJECTS_PER_SCENE
            )));
        }
        let chunks = chunk_count_for(item.indices.len() as u32);
        if self.total_chunks + chunks > MAX_INSTANCE_CHUNKS {
            return Err(config_error(format!(
                "'{}' needs {} culling chunks but only {} of {} remain",
                item.name,
                chunks,
                MAX_INSTANCE_CHUNKS - self.total_chunks,
                MAX_INSTANCE_CHUNKS
            )));
        }
        Ok(self.add(item))
    }

    pub fn get(&self, index: ItemIndex) -> Option<&RenderItem> {
        self.items.get(index.0 as usize)
    }

    pub fn get_mut(&mut self, index: ItemIndex) -> Option<&mut RenderItem> {
        self.items.get_mut(index.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemIndex, &RenderItem)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (ItemIndex(i as u32), item))
    }

    pub fn add_visible(&mut self, layer: RenderLayer, index: ItemIndex) {
        debug_assert!((index.0 as usize) < self.items.len());
        self.visible[layer.slot()].push(index);
    }

    pub fn visible_items(&self, layer: RenderLayer) -> &[ItemIndex] {
        &self.visible[layer.slot()]
    }

    pub fn visible_count(&self) -> usize {
        self.visible.iter().map(Vec::len).sum()
    }

    pub fn clear_visible(&mut self) {
        for list in &mut self.visible {
            list.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    fn quad() -> (Vec<Vertex>, Vec<u32>) {
        let vertices = vec![
            Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0]),
            Vertex::new([1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [1.0, 1.0]),
            Vertex::new([1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [1.0, 0.0]),
            Vertex::new([-1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 0.0]),
        ];
        (vertices, vec![0, 1, 2, 0, 2, 3])
    }

    #[test]
    fn aabb_from_vertices_bounds_the_mesh() {
        let (vertices, _) = quad();
        let bounds = Aabb::from_vertices(&vertices);
        assert_eq!(bounds.center, Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(bounds.extents, Vector3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn transformed_aabb_follows_translation() {
        let (vertices, _) = quad();
        let bounds = Aabb::from_vertices(&vertices);
        let world = Matrix4::from_translation(Vector3::new(5.0, 0.0, -3.0));
        let moved = bounds.transformed(&world);
        assert_eq!(moved.center, Vector3::new(5.0, 0.0, -3.0));
        assert_eq!(moved.extents, bounds.extents);
    }

    #[test]
    fn visible_lists_are_per_layer() {
        let (vertices, indices) = quad();
        let mut store = ItemStore::new();
        let a = store.add(RenderItem::new("a", vertices.clone(), indices.clone(), MaterialIndex(0)));
        let b = store.add(RenderItem::new("b", vertices, indices, MaterialIndex(0)));

        store.add_visible(RenderLayer::Opaque, a);
        store.add_visible(RenderLayer::Occluder, b);

        assert_eq!(store.visible_items(RenderLayer::Opaque), &[a]);
        assert_eq!(store.visible_items(RenderLayer::Occluder), &[b]);
        assert_eq!(store.visible_count(), 2);

        store.clear_visible();
        assert_eq!(store.visible_count(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn cluster_bounds_follow_index_runs() {
        // 128 vertices strung along +x, indexed in order: cluster 0 spans
        // x in [0, 63], cluster 1 spans [64, 127].
        let vertices: Vec<Vertex> = (0..128)
            .map(|i| Vertex::new([i as f32, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0]))
            .collect();
        let indices: Vec<u32> = (0..128).collect();
        let item = RenderItem::new("strip", vertices, indices, MaterialIndex(0));

        let bounds = item.cluster_bounds();
        assert_eq!(bounds.len(), 2);
        assert_eq!(bounds[0].center.x, 31.5);
        assert_eq!(bounds[0].extents.x, 31.5);
        assert_eq!(bounds[1].center.x, 95.5);
        assert_eq!(bounds[1].extents.x, 31.5);
    }

    #[test]
    fn empty_geometry_gets_one_fallback_cluster() {
        let item = RenderItem::new("empty", Vec::new(), Vec::new(), MaterialIndex(0));
        let bounds = item.cluster_bounds();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0], item.bounds);
    }

    #[test]
    fn store_rejects_geometry_past_the_chunk_budget() {
        use crate::constants::scene::MAX_MESH_VERTICES_PER_SCENE;
        let (vertices, _) = quad();
        let mut store = ItemStore::new();
        // One item whose index count alone overflows the whole-scene chunk
        // capacity.
        let indices = vec![0u32; (MAX_MESH_VERTICES_PER_SCENE + 512) as usize];
        assert!(store
            .try_add(RenderItem::new("huge", vertices, indices, MaterialIndex(0)))
            .is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn store_rejects_the_object_past_the_scene_cap() {
        use crate::constants::scene::MAX_OBJECTS_PER_SCENE;
        let (vertices, indices) = quad();
        let mut store = ItemStore::new();
        for i in 0..MAX_OBJECTS_PER_SCENE {
            store
                .try_add(RenderItem::new(
                    format!("item{i}"),
                    vertices.clone(),
                    indices.clone(),
                    MaterialIndex(0),
                ))
                .unwrap();
        }
        assert!(store
            .try_add(RenderItem::new("extra", vertices, indices, MaterialIndex(0)))
            .is_err());
    }

    #[test]
    fn new_items_start_fully_dirty() {
        let (vertices, indices) = quad();
        let item = RenderItem::new("a", vertices, indices, MaterialIndex(0));
        assert_eq!(item.num_frames_dirty, MAX_FRAMES_IN_FLIGHT);
    }
}
