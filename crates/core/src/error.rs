use thiserror::Error;

/// Failure taxonomy for the upscaling engine.
///
/// Tile-scoped variants (`TileExtractionFailed`, `InferenceFailed`) are
/// absorbed by the orchestrator as per-frame skip counters; frame-scoped
/// variants abort the frame or the whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("tile extraction failed: {reason}")]
    TileExtractionFailed { reason: String },

    #[error("inference failed: {reason}")]
    InferenceFailed { reason: String },

    #[error("buffer allocation failed for {width}x{height} output")]
    BufferAllocationFailed { width: u64, height: u64 },

    #[error("frame source failed")]
    SourceFailed(#[source] anyhow::Error),

    #[error("frame sink failed")]
    SinkFailed(#[source] anyhow::Error),

    #[error("post-filter chain failed")]
    PostFilterFailed(#[source] anyhow::Error),

    /// Not a fault. Emitted when a caller-requested cancellation interrupts
    /// processing before a frame could be finished.
    #[error("processing cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn tile_extraction(reason: impl Into<String>) -> Self {
        Self::TileExtractionFailed {
            reason: reason.into(),
        }
    }

    pub fn inference(reason: impl Into<String>) -> Self {
        Self::InferenceFailed {
            reason: reason.into(),
        }
    }

    /// True for failures that only invalidate a single tile. The frame
    /// keeps compositing with the remaining tiles.
    pub fn is_tile_scoped(&self) -> bool {
        matches!(
            self,
            Self::TileExtractionFailed { .. } | Self::InferenceFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_scoped_errors_are_classified() {
        assert!(EngineError::tile_extraction("short buffer").is_tile_scoped());
        assert!(EngineError::inference("backend rejected tensor").is_tile_scoped());
        assert!(!EngineError::invalid_configuration("overlap too large").is_tile_scoped());
        assert!(!EngineError::BufferAllocationFailed {
            width: 100,
            height: 100
        }
        .is_tile_scoped());
        assert!(!EngineError::Cancelled.is_tile_scoped());
    }

    #[test]
    fn display_includes_reason() {
        let error = EngineError::invalid_configuration("overlap must be smaller than tile size");
        assert_eq!(
            error.to_string(),
            "invalid configuration: overlap must be smaller than tile size"
        );
    }
}
