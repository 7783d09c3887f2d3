//! Camera identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a camera within the configured camera set.
///
/// Identifiers are dense: camera `n` is the `n`-th entry of
/// [`IngestConfig::cameras`](crate::config::IngestConfig::cameras) and owns
/// decoder slots `n * buffers_per_camera ..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u8);

impl CameraId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Camera owning decoder slot `slot`.
    pub fn for_slot(slot: usize, buffers_per_camera: usize) -> Self {
        Self((slot / buffers_per_camera.max(1)) as u8)
    }
}

impl From<u8> for CameraId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
