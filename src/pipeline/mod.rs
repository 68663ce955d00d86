//! Render pipelines
//!
//! Two drivers over the same frame-resource protocol: the deferred path with
//! GPU-driven culling in front of an indirect G-Buffer fill, and a plain
//! forward path for scenes too small to be worth culling. `ScenePipeline`
//! is the switchable front the application talks to.

pub mod context;
pub mod deferred;
pub mod forward;
pub mod gbuffer;

pub use context::RenderContext;
pub use deferred::DeferredPipeline;
pub use forward::ForwardPipeline;
pub use gbuffer::GBuffer;

use crate::camera::Camera;
use crate::error::EngineResult;
use crate::scene::{ItemIndex, Material, MaterialIndex, RenderItem, RenderLayer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Deferred,
    Forward,
}

pub enum ScenePipeline {
    Deferred(DeferredPipeline),
    Forward(ForwardPipeline),
}

impl ScenePipeline {
    pub fn new(kind: PipelineKind, context: &RenderContext, arena_capacity: u64) -> Self {
        match kind {
            PipelineKind::Deferred => {
                Self::Deferred(DeferredPipeline::new(context, arena_capacity))
            }
            PipelineKind::Forward => Self::Forward(ForwardPipeline::new(context, arena_capacity)),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Deferred(_) => PipelineKind::Deferred,
            Self::Forward(_) => PipelineKind::Forward,
        }
    }

    pub fn push_material(&mut self, material: Material) -> MaterialIndex {
        match self {
            Self::Deferred(p) => p.push_material(material),
            Self::Forward(p) => p.push_material(material),
        }
    }

    pub fn push_model(&mut self, item: RenderItem) -> EngineResult<ItemIndex> {
        match self {
            Self::Deferred(p) => p.push_model(item),
            Self::Forward(p) => p.push_model(item),
        }
    }

    pub fn push_models(&mut self, models: Vec<RenderItem>) -> EngineResult<Vec<ItemIndex>> {
        match self {
            Self::Deferred(p) => p.push_models(models),
            Self::Forward(p) => p.push_models(models),
        }
    }

    pub fn push_visible_models(&mut self, layer: RenderLayer, indices: &[ItemIndex]) {
        match self {
            Self::Deferred(p) => p.push_visible_models(layer, indices),
            Self::Forward(p) => p.push_visible_models(layer, indices),
        }
    }

    pub fn update(
        &mut self,
        camera: &mut Camera,
        total_time: f32,
        delta_time: f32,
    ) -> EngineResult<()> {
        match self {
            Self::Deferred(p) => p.update(camera, total_time, delta_time),
            Self::Forward(p) => p.update(camera, total_time, delta_time),
        }
    }

    pub fn draw(&mut self, target: &wgpu::TextureView) -> EngineResult<()> {
        match self {
            Self::Deferred(p) => p.draw(target),
            Self::Forward(p) => p.draw(target),
        }
    }

    pub fn on_resize(&mut self, width: u32, height: u32) {
        match self {
            Self::Deferred(p) => p.on_resize(width, height),
            Self::Forward(p) => p.on_resize(width, height),
        }
    }

    pub fn flush(&mut self) -> EngineResult<()> {
        match self {
            Self::Deferred(p) => p.flush(),
            Self::Forward(p) => p.flush(),
        }
    }
}
