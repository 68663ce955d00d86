//! GPU-driven occlusion culling
//!
//! Four stages per frame, all on the GPU: build the Hi-Z pyramid from the
//! occluder depth prepass, cull instances against it, expand surviving
//! chunks into clusters, cull clusters, and hand the resulting indirect
//! commands straight to the G-Buffer fill.

pub mod append_buffer;
pub mod chunk_expand;
pub mod cluster_cull;
pub mod hiz;
pub mod instance_cull;
pub mod validation;

#[cfg(test)]
mod tests;

pub use append_buffer::{align_for_counter, AppendBuffer, CounterResetSource};
pub use chunk_expand::ChunkExpandPass;
pub use cluster_cull::ClusterCullPass;
pub use hiz::HiZPyramid;
pub use instance_cull::InstanceCullPass;
