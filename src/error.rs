use thiserror::Error;

use crate::avtp::ProtocolError;
use crate::camera::CameraId;
use crate::decoder::SlotState;

/// Ingestion error type.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Sync lost [camera {camera}]: {reason}")]
    SyncLoss { camera: CameraId, reason: String },

    #[error("No input buffer available for camera {0}")]
    ResourceExhausted(CameraId),

    #[error("Decoder device error [{device}]: {reason}")]
    Device { device: String, reason: String },

    #[error("Buffer consistency fault: input #{input} dequeued with output #{output}")]
    Consistency { input: usize, output: usize },

    #[error("Slot #{index}: {event} is not valid in state {state}")]
    InvalidTransition {
        index: usize,
        state: SlotState,
        event: &'static str,
    },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Decoder session is not active")]
    Inactive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl IngestError {
    /// Shorthand for a decoder device failure.
    pub fn device(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Faults that end the completion thread and require a session restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Device { .. } | Self::Consistency { .. } | Self::InvalidTransition { .. }
        )
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, IngestError>;
