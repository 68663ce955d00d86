pub mod camera;
pub mod constants;
pub mod culling;
pub mod error;
pub mod pipeline;
pub mod scene;
pub mod sync;
pub mod upload;

pub use camera::Camera;
pub use error::{EngineError, EngineResult};
pub use pipeline::{DeferredPipeline, ForwardPipeline, PipelineKind, RenderContext, ScenePipeline};
pub use scene::{
    Aabb, ItemIndex, ItemStore, Material, MaterialIndex, MaterialStore, RenderItem, RenderLayer,
    Vertex,
};
pub use sync::GpuTimeline;
pub use upload::{FrameArena, UploadRingAllocator};

/// Renderer configuration
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub pipeline: PipelineKind,
    /// Upload arena size in bytes. Must hold the worst-case frame times the
    /// number of frames kept in flight.
    pub arena_capacity: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineKind::Deferred,
            arena_capacity: constants::upload::DEFAULT_ARENA_CAPACITY,
        }
    }
}

impl RendererConfig {
    pub fn build(&self, context: &RenderContext) -> ScenePipeline {
        ScenePipeline::new(self.pipeline, context, self.arena_capacity)
    }
}
