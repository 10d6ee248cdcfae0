// Recording sessions - state machine, drive allocation and sync control

pub mod allocation;
pub mod drives;
pub mod node;
pub mod state;
pub mod sync;

pub use drives::{Drive, DrivePool};
pub use node::CaptureNode;
pub use state::SessionState;
pub use sync::{HardwareSync, NodeContext, NotificationListener};

use crate::source::SourceError;

/// Error type for session transitions
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Cannot record: {0}")]
    CannotRecord(String),

    #[error("No capturing camera to record")]
    NoCameras,

    #[error("Camera {0} is already registered")]
    DuplicateCamera(String),

    #[error("Invalid parameters: {0}")]
    BadParams(String),

    #[error("Invalid parameters: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
