//! Decoder device and consumer seams.

use std::os::fd::{OwnedFd, RawFd};

use serde::Serialize;

use super::pool::DecodedFrame;
use crate::camera::CameraId;
use crate::config::DecoderConfig;
use crate::error::Result;
use crate::utils::MemoryRegion;

/// NV12 fourcc as the V4L2 `v4l2_fourcc('N','V','1','2')`.
pub const FOURCC_NV12: u32 = u32::from_le_bytes(*b"NV12");
/// JPEG fourcc as the V4L2 `v4l2_fourcc('J','P','E','G')`.
pub const FOURCC_JPEG: u32 = u32::from_le_bytes(*b"JPEG");

/// Frame geometry the device is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecoderGeometry {
    pub width: u32,
    pub height: u32,
    /// Size of one compressed input buffer.
    pub max_frame_length: usize,
}

impl DecoderGeometry {
    pub fn from_config(config: &DecoderConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            max_frame_length: config.max_frame_length,
        }
    }

    /// Bytes of one NV12 output frame.
    pub fn output_len(&self) -> usize {
        self.width as usize * self.height as usize * 3 / 2
    }
}

/// One device buffer mapped into the process.
#[derive(Debug)]
pub struct MappedBuffer {
    pub index: usize,
    pub region: MemoryRegion,
    /// Exported DMA-buf, when requested.
    pub dmabuf: Option<OwnedFd>,
}

/// Input (compressed) and output (decoded) buffers, sharing one index space.
#[derive(Debug)]
pub struct DevicePools {
    pub inputs: Vec<MappedBuffer>,
    pub outputs: Vec<MappedBuffer>,
}

/// A decoded buffer pair taken back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub input: usize,
    pub output: usize,
    /// Bytes written to the output buffer.
    pub bytes_used: usize,
}

/// Memory-to-memory JPEG decoder with index-based enqueue / dequeue.
///
/// Input buffer `j` is always queued together with output buffer `j`; the
/// device hands both back together once decoding is done.
pub trait DecoderDevice: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Set JPEG input and NV12 output formats.
    fn configure(&self, geometry: &DecoderGeometry) -> Result<()>;

    /// Request, map and start `count` buffers on both queues.
    fn allocate(&self, count: usize, export_dmabuf: bool) -> Result<DevicePools>;

    /// Queue input `index` holding `bytes_used` compressed bytes, and output `index`.
    fn queue_pair(&self, index: usize, bytes_used: usize) -> Result<()>;

    /// Block until a decoded pair can be dequeued.
    fn wait_ready(&self) -> Result<()>;

    /// Take back the next decoded pair.
    fn dequeue_pair(&self) -> Result<Completion>;

    /// Stop streaming and free the device buffers.
    ///
    /// All mappings returned by `allocate` must be gone by then.
    fn release(&self) -> Result<()>;
}

/// Description of an output buffer given to the consumer up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputBufferInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub len: usize,
    /// Exported DMA-buf descriptor, valid while the session runs.
    pub dmabuf: Option<RawFd>,
}

/// Downstream side receiving decoded frames.
pub trait FrameConsumer: Send + Sync {
    /// Called once per output buffer before decoding starts.
    fn allocate(&self, info: &OutputBufferInfo) -> Result<()>;

    /// Take ownership of a decoded frame.
    ///
    /// The output buffer is recycled once the last clone of `frame` is
    /// dropped; it may be dropped right here.
    fn process(&self, camera: CameraId, frame: DecodedFrame) -> Result<()>;
}
