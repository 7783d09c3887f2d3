//! Per-camera JPEG frame reassembly.
//!
//! Cameras slice each JPEG image into AVTP PDUs. The assembler hunts for a PDU
//! starting with SOI, copies payloads into a decoder input buffer until one
//! ends with EOI, and hands the buffer back to the pool for decoding. Any
//! sequence gap or oversized frame sends it back to hunting.

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::pdu::AvtpPdu;
use crate::camera::CameraId;
use crate::error::{IngestError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// A writable frame buffer lent by an [`InputPool`].
pub trait FrameBuffer {
    /// Usable bytes.
    fn capacity(&self) -> usize;

    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Capture time of the frame, in nanoseconds.
    fn set_timestamp(&mut self, timestamp: u64);

    /// Final length of the compressed frame.
    fn set_len(&mut self, len: usize);
}

/// Source of input buffers and sink of completed frames.
///
/// Dropping a buffer without submitting it gives it back to the pool.
pub trait InputPool {
    type Buffer: FrameBuffer;

    /// Take a free buffer for `camera`, or `None` if none can be had.
    fn acquire(&self, camera: CameraId) -> Option<Self::Buffer>;

    /// Hand a completed frame over for decoding.
    fn submit(&self, buffer: Self::Buffer) -> Result<()>;
}

/// Why a PDU did not contribute to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload of two bytes or less.
    Runt,
    /// Not a valid camera-stream PDU.
    Malformed,
    /// Searching and the payload does not start with SOI.
    NoSoi,
    /// SOI found but the pool had no buffer.
    NoBuffer,
    /// Frame does not fit the buffer.
    Overflow,
    /// Frame completed but could not be queued.
    SubmitFailed,
    /// No assembler for the camera.
    UnknownCamera,
}

/// Result of feeding one PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduOutcome {
    /// Payload appended to the frame in progress.
    Collecting,
    /// A frame of the given length was submitted.
    FrameComplete(usize),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// No PDU seen yet; the first one seeds the sequence counter.
    Uninit,
    /// Waiting for a PDU starting with SOI.
    Searching,
    Collecting,
}

/// Per-camera counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblerStats {
    pub pdus: u64,
    pub protocol_errors: u64,
    pub no_soi: u64,
    pub no_buffer: u64,
    pub discontinuities: u64,
    pub overflows: u64,
    pub frames: u64,
    pub bytes: u64,
}

/// JPEG frame reassembler for one camera.
pub struct FrameAssembler<P: InputPool> {
    camera: CameraId,
    pool: P,
    state: AssemblerState,
    /// Next expected 8-bit sequence number.
    expected_seq: u8,
    discontinuity: bool,
    buffer: Option<P::Buffer>,
    written: usize,
    stats: AssemblerStats,
    throttle: LogThrottler,
}

impl<P: InputPool> FrameAssembler<P> {
    pub fn new(camera: CameraId, pool: P) -> Self {
        Self {
            camera,
            pool,
            state: AssemblerState::Uninit,
            expected_seq: 0,
            discontinuity: false,
            buffer: None,
            written: 0,
            stats: AssemblerStats::default(),
            throttle: LogThrottler::default(),
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Whether a buffer is held (collecting, or kept after an aborted frame).
    pub fn holds_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Feed one PDU (starting at the AVTP header) received at `timestamp`.
    pub fn pdu(&mut self, bytes: &[u8], timestamp: u64) -> PduOutcome {
        let pdu = match AvtpPdu::parse(bytes) {
            Ok(pdu) => pdu,
            Err(e) => {
                // sequence counter is left as is
                self.stats.protocol_errors += 1;
                warn_throttled!(
                    self.throttle,
                    "protocol",
                    "camera-{}: {}",
                    self.camera,
                    IngestError::from(e)
                );
                return PduOutcome::Dropped(DropReason::Malformed);
            }
        };
        self.stats.pdus += 1;

        if pdu.sequence != self.expected_seq && self.state != AssemblerState::Uninit {
            self.discontinuity = true;
            self.stats.discontinuities += 1;
            let err = IngestError::SyncLoss {
                camera: self.camera,
                reason: format!("disc: {:02X} != {:02X}", pdu.sequence, self.expected_seq),
            };
            warn_throttled!(self.throttle, "discontinuity", "{}", err);
        }

        let outcome = self.collect(pdu.payload, timestamp);
        self.expected_seq = pdu.sequence.wrapping_add(1);
        outcome
    }

    fn collect(&mut self, data: &[u8], timestamp: u64) -> PduOutcome {
        if data.len() <= 2 {
            return PduOutcome::Dropped(DropReason::Runt);
        }

        if self.state == AssemblerState::Uninit {
            self.state = AssemblerState::Searching;
        } else if self.discontinuity {
            // keep the buffer (if any) for the next frame
            self.discontinuity = false;
            self.state = AssemblerState::Searching;
            debug!(camera = %self.camera, "discontinuity detected");
        }

        if self.state == AssemblerState::Searching {
            if data[..2] != SOI {
                self.stats.no_soi += 1;
                trace!(camera = %self.camera, "no SOI tag; drop frame");
                return PduOutcome::Dropped(DropReason::NoSoi);
            }
            if self.buffer.is_none() {
                match self.pool.acquire(self.camera) {
                    Some(buffer) => self.buffer = Some(buffer),
                    None => {
                        self.stats.no_buffer += 1;
                        warn_throttled!(
                            self.throttle,
                            "no-buffer",
                            "{}; drop frame",
                            IngestError::ResourceExhausted(self.camera)
                        );
                        return PduOutcome::Dropped(DropReason::NoBuffer);
                    }
                }
            }
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.set_timestamp(timestamp);
            }
            self.written = 0;
            self.state = AssemblerState::Collecting;
            trace!(camera = %self.camera, "SOI tag found");
        }

        let Some(buffer) = self.buffer.as_mut() else {
            self.state = AssemblerState::Searching;
            return PduOutcome::Dropped(DropReason::NoBuffer);
        };

        let capacity = buffer.capacity();
        if data.len() > capacity - self.written {
            self.stats.overflows += 1;
            self.state = AssemblerState::Searching;
            warn_throttled!(
                self.throttle,
                "overflow",
                "camera-{}: frame is too long (> {} bytes)",
                self.camera,
                capacity
            );
            return PduOutcome::Dropped(DropReason::Overflow);
        }

        let slice = buffer.as_mut_slice();
        let end = self.written + data.len();
        slice[self.written..end].copy_from_slice(data);
        self.written = end;

        // EOI may be followed by one byte of padding
        let frame_len = if slice[end - 2..end] == EOI {
            end
        } else if slice[end - 3..end - 1] == EOI {
            end - 1
        } else {
            return PduOutcome::Collecting;
        };

        self.state = AssemblerState::Searching;
        self.written = 0;
        let Some(mut buffer) = self.buffer.take() else {
            return PduOutcome::Dropped(DropReason::NoBuffer);
        };
        buffer.set_len(frame_len);
        trace!(camera = %self.camera, "frame received ({} bytes)", frame_len);

        match self.pool.submit(buffer) {
            Ok(()) => {
                self.stats.frames += 1;
                self.stats.bytes += frame_len as u64;
                if !self.throttle.is_quiet() {
                    let suppressed = self.throttle.recover();
                    info!(
                        camera = %self.camera,
                        "stream recovered ({} warnings suppressed)",
                        suppressed
                    );
                }
                PduOutcome::FrameComplete(frame_len)
            }
            Err(e) => {
                warn!(camera = %self.camera, "Failed to submit frame: {}", e);
                PduOutcome::Dropped(DropReason::SubmitFailed)
            }
        }
    }

    /// Abandon any partial frame and give the buffer back.
    pub fn reset(&mut self) {
        if self.buffer.take().is_some() {
            debug!(camera = %self.camera, "partial frame abandoned");
        }
        self.state = AssemblerState::Uninit;
        self.discontinuity = false;
        self.written = 0;
    }
}
