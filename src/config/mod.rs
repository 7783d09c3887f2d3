//! Ingestion configuration.
//!
//! Plain serde structures with defaults taken from the deployed camera rig.
//! Loading them from disk is left to the embedding application.

mod schema;

pub use schema::{
    AcquirePolicy, CameraConfig, DecoderConfig, IngestConfig, RingConfig,
    DEFAULT_MAX_FRAME_LENGTH,
};
