//! CPU/GPU synchronization

pub mod timeline;

pub use timeline::GpuTimeline;
