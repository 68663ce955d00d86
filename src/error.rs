//! Engine error handling
//!
//! Central error taxonomy for the renderer. Fatal device errors (resource
//! creation, pipeline compilation) are not represented here: wgpu validation
//! failures abort the process, matching the rest of the pipeline's
//! fail-fast discipline. `EngineError` covers everything that is worth
//! reporting instead of aborting.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A compile-time or construction-time configuration cannot work,
    /// e.g. an upload arena smaller than one frame's maximum content.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// A bounded fence wait elapsed without the GPU reaching the value.
    #[error("fence wait for value {value} timed out after {waited:?}")]
    FenceTimeout { value: u64, waited: Duration },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Create an invalid-configuration error
pub fn config_error(message: impl Into<String>) -> EngineError {
    EngineError::InvalidConfiguration {
        message: message.into(),
    }
}
