//! JPEG decoder buffer management.
//!
//! A memory-to-memory decoder owns N compressed input buffers and N decoded
//! output buffers. Input and output `j` form slot `j`; the pool hands inputs to
//! the frame assemblers, outputs to the frame consumer, and submits a slot to
//! the device once both halves are back.

pub mod device;
pub mod loopback;
pub mod pool;
pub mod session;
pub mod slot;
pub mod v4l2;

pub use device::{
    Completion, DecoderDevice, DecoderGeometry, DevicePools, FrameConsumer, MappedBuffer,
    OutputBufferInfo, FOURCC_JPEG, FOURCC_NV12,
};
pub use loopback::LoopbackDecoder;
pub use pool::{DecodedFrame, DecoderBufferPool, Dequeued, InputFrame, InputListener, PoolStats};
pub use session::{DecoderSession, SessionPhase};
pub use slot::SlotState;
pub use v4l2::V4l2JpegDecoder;

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    use super::{DecodedFrame, FrameConsumer, OutputBufferInfo};
    use crate::camera::CameraId;
    use crate::error::Result;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameRecord {
        pub camera: CameraId,
        pub index: usize,
        pub timestamp: u64,
        pub len: usize,
    }

    #[derive(Default)]
    struct CollectorState {
        allocated: Vec<OutputBufferInfo>,
        frames: Vec<FrameRecord>,
        held: Vec<DecodedFrame>,
    }

    /// Consumer recording every delivered frame, optionally keeping the loans.
    pub struct Collector {
        hold: bool,
        state: Mutex<CollectorState>,
        delivered: Condvar,
    }

    impl Collector {
        pub fn new(hold: bool) -> Self {
            Self {
                hold,
                state: Mutex::new(CollectorState::default()),
                delivered: Condvar::new(),
            }
        }

        pub fn allocated(&self) -> usize {
            self.state.lock().allocated.len()
        }

        pub fn frames(&self) -> Vec<FrameRecord> {
            self.state.lock().frames.clone()
        }

        /// Block until at least `n` frames were delivered.
        pub fn wait_frames(&self, n: usize) {
            let mut state = self.state.lock();
            while state.frames.len() < n {
                let timeout = self
                    .delivered
                    .wait_for(&mut state, Duration::from_secs(5));
                if timeout.timed_out() && state.frames.len() < n {
                    panic!("expected {} frames, got {}", n, state.frames.len());
                }
            }
        }

        /// Return the oldest held frame to the pool.
        pub fn release_one(&self) {
            let frame = {
                let mut state = self.state.lock();
                if state.held.is_empty() {
                    None
                } else {
                    Some(state.held.remove(0))
                }
            };
            drop(frame);
        }

        pub fn release_all(&self) {
            let frames = std::mem::take(&mut self.state.lock().held);
            drop(frames);
        }
    }

    impl FrameConsumer for Collector {
        fn allocate(&self, info: &OutputBufferInfo) -> Result<()> {
            self.state.lock().allocated.push(*info);
            Ok(())
        }

        fn process(&self, camera: CameraId, frame: DecodedFrame) -> Result<()> {
            let record = FrameRecord {
                camera,
                index: frame.index(),
                timestamp: frame.timestamp(),
                len: frame.len(),
            };
            let mut state = self.state.lock();
            state.frames.push(record);
            if self.hold {
                state.held.push(frame);
                drop(state);
            } else {
                drop(state);
                drop(frame);
            }
            self.delivered.notify_all();
            Ok(())
        }
    }
}
