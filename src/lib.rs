//! AVB camera ingestion.
//!
//! Receives MJPEG camera streams carried in AVTP frames over raw Ethernet,
//! reassembles JPEG frames per camera, and feeds them through a shared
//! memory-to-memory JPEG decoder whose input and output buffers are paired
//! slot by slot.

pub mod avtp;
pub mod camera;
pub mod config;
pub mod decoder;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod net;
pub mod utils;

pub use camera::CameraId;
pub use error::{IngestError, Result};
pub use ingest::LiveIngest;
