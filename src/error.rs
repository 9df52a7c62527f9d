/// Failures of a single capture activation.
///
/// None of these are fatal to the hosting service: the coordinator reports them,
/// releases any capture resources, and returns to idle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("screen capture permission was denied")]
    PermissionDenied,

    #[error("capture resources unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("no frame was available after the settling interval")]
    NoFrameAvailable,

    #[error("failed to encode captured frame: {0}")]
    EncodingFailure(String),

    #[error("capture service could not start in the foreground: {0}")]
    StartRestricted(String),
}

impl CaptureError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        CaptureError::ResourceUnavailable(reason.into())
    }

    pub fn encoding(reason: impl Into<String>) -> Self {
        CaptureError::EncodingFailure(reason.into())
    }

    /// Short message suitable for a toast or status line.
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => "Screen capture permission was denied.",
            CaptureError::ResourceUnavailable(_) => {
                "Screen capture is busy or unavailable right now."
            }
            CaptureError::NoFrameAvailable => "Could not read the screen. Tap again to retry.",
            CaptureError::EncodingFailure(_) => "Could not process the captured image.",
            CaptureError::StartRestricted(_) => {
                "The capture service was blocked from starting in the background."
            }
        }
    }

    pub fn suggests_retry(&self) -> bool {
        matches!(self, CaptureError::NoFrameAvailable)
    }
}
