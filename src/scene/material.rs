//! Material table
//!
//! Materials are deduplicated by name when models are pushed; each gets a
//! stable table index plus diffuse/normal texture indices. The GPU-side table
//! is re-uploaded only while `num_frames_dirty > 0`, so every in-flight frame
//! region eventually carries current data.

use cgmath::{Matrix4, SquareMatrix};

use crate::constants::upload::MAX_FRAMES_IN_FLIGHT;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MaterialIndex(pub u32);

pub struct Material {
    pub name: String,
    pub diffuse_albedo: [f32; 4],
    pub fresnel_r0: [f32; 3],
    pub roughness: f32,
    pub transform: Matrix4<f32>,
    pub diffuse_map_index: u32,
    pub normal_map_index: u32,
    pub num_frames_dirty: usize,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diffuse_albedo: [1.0, 1.0, 1.0, 1.0],
            fresnel_r0: [0.04, 0.04, 0.04],
            roughness: 0.5,
            transform: Matrix4::identity(),
            diffuse_map_index: 0,
            normal_map_index: 0,
            num_frames_dirty: MAX_FRAMES_IN_FLIGHT,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.num_frames_dirty = MAX_FRAMES_IN_FLIGHT;
    }
}

/// Dense material storage with name deduplication
#[derive(Default)]
pub struct MaterialStore {
    materials: Vec<Material>,
    next_texture_index: u32,
}

impl MaterialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a material, assigning diffuse/normal texture indices. A name
    /// already in the table returns the existing index unchanged.
    pub fn insert(&mut self, mut material: Material) -> MaterialIndex {
        if let Some(existing) = self.index_of(&material.name) {
            return existing;
        }
        material.diffuse_map_index = self.next_texture_index;
        material.normal_map_index = self.next_texture_index + 1;
        self.next_texture_index += 2;

        let index = MaterialIndex(self.materials.len() as u32);
        self.materials.push(material);
        index
    }

    pub fn index_of(&self, name: &str) -> Option<MaterialIndex> {
        self.materials
            .iter()
            .position(|m| m.name == name)
            .map(|i| MaterialIndex(i as u32))
    }

    pub fn get(&self, index: MaterialIndex) -> Option<&Material> {
        self.materials.get(index.0 as usize)
    }

    pub fn get_mut(&mut self, index: MaterialIndex) -> Option<&mut Material> {
        self.materials.get_mut(index.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Material> {
        self.materials.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Material> {
        self.materials.iter_mut()
    }

    pub fn any_dirty(&self) -> bool {
        self.materials.iter().any(|m| m.num_frames_dirty > 0)
    }
}
