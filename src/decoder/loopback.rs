//! Software decoder device.
//!
//! Accepts buffer pairs like a memory-to-memory device and completes them in
//! submission order without touching pixel data. Used where no JPEG hardware
//! is present and to drive the pool in tests; completions can be paused and
//! faults injected.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::device::{Completion, DecoderDevice, DecoderGeometry, DevicePools, MappedBuffer};
use crate::error::{IngestError, Result};
use crate::utils::MemoryRegion;

#[derive(Default)]
struct LoopbackState {
    geometry: Option<DecoderGeometry>,
    count: usize,
    pending: VecDeque<(usize, usize)>,
    paused: bool,
    submissions: Vec<usize>,
    last_bytes_used: Vec<Option<usize>>,
    fail_queue: bool,
    fail_dequeue: bool,
    mismatch_next: bool,
    released: bool,
}

/// Decoder device completing every queued pair immediately.
pub struct LoopbackDecoder {
    name: String,
    state: Mutex<LoopbackState>,
    ready: Condvar,
}

impl LoopbackDecoder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LoopbackState::default()),
            ready: Condvar::new(),
        }
    }

    /// Hold back completions until unpaused.
    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
        self.ready.notify_all();
    }

    /// Make every following `queue_pair` fail.
    pub fn fail_queue(&self, fail: bool) {
        self.state.lock().fail_queue = fail;
    }

    /// Make every following `dequeue_pair` fail.
    pub fn fail_dequeue(&self, fail: bool) {
        self.state.lock().fail_dequeue = fail;
    }

    /// Report the next completion with a mismatched output index.
    pub fn mismatch_next(&self) {
        self.state.lock().mismatch_next = true;
    }

    /// Times slot `index` was queued.
    pub fn submissions(&self, index: usize) -> usize {
        self.state.lock().submissions.get(index).copied().unwrap_or(0)
    }

    pub fn total_submissions(&self) -> usize {
        self.state.lock().submissions.iter().sum()
    }

    /// Compressed length of the last submission of slot `index`.
    pub fn last_bytes_used(&self, index: usize) -> Option<usize> {
        self.state.lock().last_bytes_used.get(index).copied().flatten()
    }

    /// Pairs queued and not dequeued yet.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl DecoderDevice for LoopbackDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, geometry: &DecoderGeometry) -> Result<()> {
        self.state.lock().geometry = Some(*geometry);
        Ok(())
    }

    fn allocate(&self, count: usize, export_dmabuf: bool) -> Result<DevicePools> {
        let mut state = self.state.lock();
        let Some(geometry) = state.geometry else {
            return Err(IngestError::device(&self.name, "format not configured"));
        };
        if export_dmabuf {
            debug!("{}: DMA-buf export not available", self.name);
        }

        let buffers = |len: usize| -> Vec<MappedBuffer> {
            (0..count)
                .map(|index| MappedBuffer {
                    index,
                    region: MemoryRegion::anonymous(len),
                    dmabuf: None,
                })
                .collect()
        };
        let pools = DevicePools {
            inputs: buffers(geometry.max_frame_length),
            outputs: buffers(geometry.output_len()),
        };

        state.count = count;
        state.pending.clear();
        state.submissions = vec![0; count];
        state.last_bytes_used = vec![None; count];
        state.released = false;
        Ok(pools)
    }

    fn queue_pair(&self, index: usize, bytes_used: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_queue {
            return Err(IngestError::device(&self.name, "queue failed"));
        }
        if index >= state.count {
            return Err(IngestError::device(
                &self.name,
                format!("invalid buffer index {}", index),
            ));
        }
        state.submissions[index] += 1;
        state.last_bytes_used[index] = Some(bytes_used);
        state.pending.push_back((index, bytes_used));
        drop(state);

        self.ready.notify_all();
        Ok(())
    }

    fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.paused || state.pending.is_empty() {
            if state.released {
                return Err(IngestError::device(&self.name, "device released"));
            }
            self.ready.wait(&mut state);
        }
        Ok(())
    }

    fn dequeue_pair(&self) -> Result<Completion> {
        let mut state = self.state.lock();
        if state.fail_dequeue {
            return Err(IngestError::device(&self.name, "dequeue failed"));
        }
        let Some((input, _)) = state.pending.pop_front() else {
            return Err(IngestError::device(&self.name, "nothing to dequeue"));
        };
        let output = if std::mem::take(&mut state.mismatch_next) {
            (input + 1) % state.count.max(1)
        } else {
            input
        };
        let bytes_used = state.geometry.map_or(0, |g| g.output_len());
        Ok(Completion {
            input,
            output,
            bytes_used,
        })
    }

    fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.released = true;
        drop(state);

        self.ready.notify_all();
        debug!("{}: buffers released", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_in_order() {
        let device = LoopbackDecoder::new("loopback");
        assert!(device.allocate(2, false).is_err());

        device
            .configure(&DecoderGeometry {
                width: 16,
                height: 16,
                max_frame_length: 1024,
            })
            .unwrap();
        let pools = device.allocate(2, true).unwrap();
        assert_eq!(pools.inputs.len(), 2);
        assert_eq!(pools.inputs[1].region.len(), 1024);
        assert_eq!(pools.outputs[0].region.len(), 384);

        device.queue_pair(1, 10).unwrap();
        device.queue_pair(0, 20).unwrap();
        assert!(device.queue_pair(2, 1).is_err());

        device.wait_ready().unwrap();
        assert_eq!(device.dequeue_pair().unwrap().input, 1);
        assert_eq!(device.dequeue_pair().unwrap().input, 0);
        assert!(device.dequeue_pair().is_err());
        assert_eq!(device.submissions(1), 1);
        assert_eq!(device.last_bytes_used(0), Some(20));
    }

    #[test]
    fn test_paused_completion() {
        let device = std::sync::Arc::new(LoopbackDecoder::new("loopback"));
        device
            .configure(&DecoderGeometry {
                width: 16,
                height: 16,
                max_frame_length: 64,
            })
            .unwrap();
        let _pools = device.allocate(1, false).unwrap();
        device.set_paused(true);
        device.queue_pair(0, 4).unwrap();

        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || device.wait_ready())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        device.set_paused(false);
        waiter.join().unwrap().unwrap();
        assert_eq!(device.pending(), 1);
    }
}
