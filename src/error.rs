use thiserror::Error;

/// Error kinds raised by the glitcher core.
///
/// Only `InvalidParameter`, `GoldenCaptureFailed`, `Hardware` and `Config` ever reach
/// the operator as failures. The remaining kinds are absorbed by the campaign loop
/// into its classification and statistics.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GlitchError {
    /// Out-of-range nanosecond or clock request. No state was changed.
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// Raw clock conversion produced a count the engine cannot load.
    #[error("clock count {clocks} outside 0..={max}")]
    OutOfRange { clocks: i64, max: u32 },

    /// Attempt 0 did not deliver a full reference block.
    #[error("golden ciphertext capture failed: received {received} of 16 bytes")]
    GoldenCaptureFailed { received: usize },

    #[error("capture timed out after {attempts} polls with {received} bytes buffered")]
    CaptureTimeout { attempts: u32, received: usize },

    #[error("fault corpus capacity of {capacity} records exceeded")]
    CorpusCapacityExceeded { capacity: usize },

    #[error("key recovery oracle returned no guess")]
    OracleInconclusive,

    #[error("hardware fault: {0}")]
    Hardware(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GlitchError {
    /// Shorthand for building an `InvalidParameter` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        GlitchError::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// True for kinds the campaign tolerates and folds into its statistics.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            GlitchError::CaptureTimeout { .. }
                | GlitchError::CorpusCapacityExceeded { .. }
                | GlitchError::OracleInconclusive
        )
    }
}
