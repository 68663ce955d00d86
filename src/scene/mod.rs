//! Scene-side render data
//!
//! Render items and materials live in dense index-referenced stores. Pipelines
//! hold `ItemIndex`/`MaterialIndex` handles, never references into the stores,
//! so scene mutation and frame packing cannot alias.

pub mod material;
pub mod render_item;

pub use material::{Material, MaterialIndex, MaterialStore};
pub use render_item::{Aabb, ItemIndex, ItemStore, RenderItem, RenderLayer, Vertex};
