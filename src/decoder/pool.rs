//! Decoder buffer pool.
//!
//! Input and output buffers share one index space: input `j` is always decoded
//! into output `j`. Slot `j` belongs to camera `j / buffers_per_camera`. Each
//! camera has a FIFO of free input slots; outputs are lent to the consumer as
//! [`DecodedFrame`]s and come back when the last clone is dropped.
//!
//! All bookkeeping sits behind one mutex. It is never held across a device
//! call or a consumer callback.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::device::{
    DecoderDevice, DecoderGeometry, DevicePools, MappedBuffer, OutputBufferInfo, FOURCC_NV12,
};
use super::session::SessionPhase;
use super::slot::SlotState;
use crate::avtp::{FrameBuffer, InputPool};
use crate::camera::CameraId;
use crate::config::{AcquirePolicy, DecoderConfig};
use crate::error::{IngestError, Result};

/// Called with a camera id when that camera's free-input FIFO refills.
pub type InputListener = Arc<dyn Fn(CameraId) + Send + Sync>;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pairs queued to the device.
    pub submitted: u64,
    /// Pairs taken back from the device.
    pub completed: u64,
    /// Frames handed to the consumer.
    pub delivered: u64,
    /// Frames completed after the session went inactive.
    pub discarded: u64,
    pub inputs_retired: u64,
    pub outputs_retired: u64,
}

/// Result of one completion step.
#[derive(Debug)]
pub enum Dequeued {
    /// Decoded frame for the consumer.
    Frame(CameraId, DecodedFrame),
    /// Slot completed while inactive; its buffers were retired.
    Discarded(usize),
    /// Inactive and nothing left on the device.
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct SlotRecord {
    state: SlotState,
    bytes_used: usize,
    timestamp: u64,
}

struct PoolState {
    phase: SessionPhase,
    activated: bool,
    fault: Option<String>,
    slots: Vec<SlotRecord>,
    /// Free input slots per camera.
    free: Vec<VecDeque<usize>>,
    /// Pairs accepted by the device and not dequeued yet.
    queued: usize,
    /// Pairs about to be queued (lock dropped for the device call).
    submitting: usize,
    /// Outputs lent to the consumer.
    in_flight: usize,
    stats: PoolStats,
}

impl PoolState {
    fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }
}

/// Paired input/output buffers of one decoder device.
pub struct DecoderBufferPool {
    // mappings go before the device buffers are released
    inputs: Vec<MappedBuffer>,
    outputs: Vec<MappedBuffer>,
    state: Mutex<PoolState>,
    /// One per camera.
    input_ready: Vec<Condvar>,
    work: Condvar,
    drained: Condvar,
    listener: Mutex<Option<InputListener>>,
    device: Arc<dyn DecoderDevice>,
    geometry: DecoderGeometry,
    buffers_per_camera: usize,
    policy: AcquirePolicy,
}

impl DecoderBufferPool {
    /// Wrap buffers allocated by `device` for `cameras` cameras.
    ///
    /// The pool starts stopped; see [`activate`](Self::activate).
    ///
    /// # Arguments
    ///
    /// * `device` - decoder the buffers belong to
    /// * `pools` - input and output buffers sharing one index space
    /// * `config` - acquisition policy and buffers reserved per camera
    /// * `cameras` - number of cameras sharing the device
    pub fn new(
        device: Arc<dyn DecoderDevice>,
        pools: DevicePools,
        config: &DecoderConfig,
        cameras: usize,
    ) -> Result<Arc<Self>> {
        let count = config.pool_size(cameras);
        if pools.inputs.len() != count || pools.outputs.len() != count {
            return Err(IngestError::device(
                device.name(),
                format!(
                    "buffer count mismatch: {}/{} (expected {})",
                    pools.inputs.len(),
                    pools.outputs.len(),
                    count
                ),
            ));
        }

        let bpc = config.buffers_per_camera;
        let free = (0..cameras)
            .map(|camera| (camera * bpc..(camera + 1) * bpc).collect())
            .collect();
        let slots = vec![
            SlotRecord {
                state: SlotState::OutputReady,
                bytes_used: 0,
                timestamp: 0,
            };
            count
        ];

        debug!(
            "Decoder pool: {} cameras x {} buffers (policy: {:?})",
            cameras, bpc, config.acquire_policy
        );

        Ok(Arc::new(Self {
            inputs: pools.inputs,
            outputs: pools.outputs,
            state: Mutex::new(PoolState {
                phase: SessionPhase::Stopped,
                activated: false,
                fault: None,
                slots,
                free,
                queued: 0,
                submitting: 0,
                in_flight: 0,
                stats: PoolStats::default(),
            }),
            input_ready: (0..cameras).map(|_| Condvar::new()).collect(),
            work: Condvar::new(),
            drained: Condvar::new(),
            listener: Mutex::new(None),
            device,
            geometry: DecoderGeometry::from_config(config),
            buffers_per_camera: bpc,
            policy: config.acquire_policy,
        }))
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn cameras(&self) -> usize {
        self.input_ready.len()
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued
    }

    /// Outputs currently lent to the consumer.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Free input slots of `camera`.
    pub fn free_inputs(&self, camera: CameraId) -> usize {
        self.state
            .lock()
            .free
            .get(camera.index())
            .map_or(0, VecDeque::len)
    }

    /// First fatal error, if any.
    pub fn fault(&self) -> Option<String> {
        self.state.lock().fault.clone()
    }

    /// Descriptions of the output buffers for the consumer.
    pub fn output_info(&self) -> Vec<OutputBufferInfo> {
        self.outputs
            .iter()
            .map(|buffer| OutputBufferInfo {
                index: buffer.index,
                width: self.geometry.width,
                height: self.geometry.height,
                fourcc: FOURCC_NV12,
                len: buffer.region.len(),
                dmabuf: buffer.dmabuf.as_ref().map(|fd| fd.as_raw_fd()),
            })
            .collect()
    }

    /// Register the input-availability listener.
    pub fn set_input_listener(&self, listener: Option<InputListener>) {
        *self.listener.lock() = listener;
    }

    /// `Stopped -> Active`, once per pool.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.activated || state.phase != SessionPhase::Stopped {
            return Err(IngestError::InvalidState("decoder pool cannot be reactivated"));
        }
        state.activated = true;
        state.phase = SessionPhase::Active;
        Ok(())
    }

    /// Clear the activity flag and wake every waiter.
    ///
    /// Returns false if the pool was not active.
    pub fn deactivate(&self) -> bool {
        let mut state = self.state.lock();
        let was_active = state.is_active();
        if was_active {
            state.phase = SessionPhase::Draining;
        }
        drop(state);

        self.wake_all();
        was_active
    }

    /// Block until every lent output came back.
    pub fn wait_drained(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            debug!("Waiting for {} decoded frames", state.in_flight);
            self.drained.wait(&mut state);
        }
    }

    /// `Draining -> Stopped`
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Draining {
            state.phase = SessionPhase::Stopped;
        }
    }

    /// Record a fatal error and stop the pool.
    pub fn fail(&self, err: &IngestError) {
        let mut state = self.state.lock();
        if state.fault.is_none() {
            error!("Decoder '{}' failed: {}", self.device.name(), err);
            state.fault = Some(err.to_string());
        }
        if state.is_active() {
            state.phase = SessionPhase::Draining;
        }
        drop(state);

        self.wake_all();
    }

    fn wake_all(&self) {
        for cond in &self.input_ready {
            cond.notify_all();
        }
        self.work.notify_all();
        self.drained.notify_all();
    }

    /// Take a free input buffer of `camera`.
    ///
    /// With [`AcquirePolicy::Block`] the call waits for one to come back;
    /// with [`AcquirePolicy::Drop`] it returns `None` at once. `None` is also
    /// returned once the pool is inactive.
    pub fn acquire_input(self: &Arc<Self>, camera: CameraId) -> Option<InputFrame> {
        self.acquire_with(camera, self.policy)
    }

    /// Take a free input buffer of `camera` without ever waiting.
    ///
    /// Used by producers running on a shared event loop, whatever the
    /// configured policy.
    pub fn try_acquire_input(self: &Arc<Self>, camera: CameraId) -> Option<InputFrame> {
        self.acquire_with(camera, AcquirePolicy::Drop)
    }

    fn acquire_with(self: &Arc<Self>, camera: CameraId, policy: AcquirePolicy) -> Option<InputFrame> {
        let cond = self.input_ready.get(camera.index())?;
        let mut state = self.state.lock();
        let index = loop {
            if !state.is_active() {
                return None;
            }
            if let Some(index) = state.free[camera.index()].pop_front() {
                break index;
            }
            match policy {
                AcquirePolicy::Drop => return None,
                AcquirePolicy::Block => {
                    trace!(camera = %camera, "waiting for input buffer");
                    cond.wait(&mut state);
                }
            }
        };
        drop(state);

        trace!(camera = %camera, index, "input buffer acquired");
        Some(InputFrame {
            pool: self.clone(),
            index,
            camera,
            len: 0,
            timestamp: 0,
            armed: true,
        })
    }

    /// Mark the input of a slot filled; queues the pair if the output is free.
    pub fn on_input_filled(&self, mut frame: InputFrame) -> Result<()> {
        frame.armed = false;
        let index = frame.index;

        let mut state = self.state.lock();
        if !state.is_active() {
            state.stats.inputs_retired += 1;
            return Err(IngestError::Inactive);
        }
        let slot = &mut state.slots[index];
        slot.bytes_used = frame.len;
        slot.timestamp = frame.timestamp;
        let submit = match slot.state.fill_input(index) {
            Ok(submit) => submit,
            Err(e) => {
                drop(state);
                self.fail(&e);
                return Err(e);
            }
        };
        if !submit {
            return Ok(());
        }
        state.submitting += 1;
        drop(state);

        self.submit(index, frame.len)
    }

    /// Hand slot `index` to the device (pool lock not held).
    fn submit(&self, index: usize, bytes_used: usize) -> Result<()> {
        let result = self.device.queue_pair(index, bytes_used);

        let mut state = self.state.lock();
        state.submitting -= 1;
        match result {
            Ok(()) => {
                state.queued += 1;
                state.stats.submitted += 1;
                trace!(index, bytes_used, "submitted");
                drop(state);
                self.work.notify_one();
                Ok(())
            }
            Err(e) => {
                drop(state);
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Wait for the next decoded pair.
    ///
    /// Blocks until something is queued, then on the device. The input
    /// buffer goes back to its camera before this returns.
    pub fn dequeue_completed(self: &Arc<Self>) -> Result<Dequeued> {
        {
            let mut state = self.state.lock();
            while state.queued == 0 {
                if !state.is_active() && state.submitting == 0 {
                    return Ok(Dequeued::Shutdown);
                }
                self.work.wait(&mut state);
            }
        }

        self.device.wait_ready()?;
        let completion = self.device.dequeue_pair()?;
        if completion.input != completion.output || completion.input >= self.len() {
            return Err(IngestError::Consistency {
                input: completion.input,
                output: completion.output,
            });
        }
        let index = completion.input;
        let camera = CameraId::for_slot(index, self.buffers_per_camera);

        let mut state = self.state.lock();
        state.queued -= 1;
        state.stats.completed += 1;
        state.slots[index].state.complete(index)?;

        let dequeued = if state.is_active() {
            state.in_flight += 1;
            state.stats.delivered += 1;
            let timestamp = state.slots[index].timestamp;
            Dequeued::Frame(
                camera,
                DecodedFrame(Arc::new(OutputLoan {
                    pool: self.clone(),
                    index,
                    camera,
                    timestamp,
                    len: completion.bytes_used,
                })),
            )
        } else {
            state.stats.discarded += 1;
            state.stats.outputs_retired += 1;
            Dequeued::Discarded(index)
        };
        drop(state);

        self.release_input(index);
        Ok(dequeued)
    }

    /// An input buffer came back (decoded or abandoned).
    fn release_input(&self, index: usize) {
        let camera = CameraId::for_slot(index, self.buffers_per_camera);
        let mut state = self.state.lock();
        if !state.is_active() {
            state.stats.inputs_retired += 1;
            return;
        }
        let fifo = &mut state.free[camera.index()];
        let refilled = fifo.is_empty();
        fifo.push_back(index);
        self.input_ready[camera.index()].notify_one();
        drop(state);

        if refilled {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener(camera);
            }
        }
    }

    /// The consumer dropped its last reference to output `index`.
    fn release_output(&self, index: usize) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        if !state.is_active() {
            state.stats.outputs_retired += 1;
            if state.in_flight == 0 {
                self.drained.notify_all();
            }
            return;
        }

        let slot = &mut state.slots[index];
        match slot.state.free_output(index) {
            Ok(false) => {}
            Ok(true) => {
                let bytes_used = slot.bytes_used;
                state.submitting += 1;
                drop(state);
                if let Err(e) = self.submit(index, bytes_used) {
                    warn!(index, "Failed to resubmit slot: {}", e);
                }
            }
            Err(e) => {
                drop(state);
                self.fail(&e);
            }
        }
    }
}

impl Drop for DecoderBufferPool {
    fn drop(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        match self.device.release() {
            Ok(()) => info!("Decoder '{}' buffers released", self.device.name()),
            Err(e) => warn!("Failed to release decoder '{}': {}", self.device.name(), e),
        }
    }
}

impl InputPool for Arc<DecoderBufferPool> {
    type Buffer = InputFrame;

    fn acquire(&self, camera: CameraId) -> Option<InputFrame> {
        self.acquire_input(camera)
    }

    fn submit(&self, buffer: InputFrame) -> Result<()> {
        self.on_input_filled(buffer)
    }
}

/// An input buffer lent to a producer.
///
/// Dropping it without [`DecoderBufferPool::on_input_filled`] puts it back in
/// its camera's FIFO.
pub struct InputFrame {
    pool: Arc<DecoderBufferPool>,
    index: usize,
    camera: CameraId,
    len: usize,
    timestamp: u64,
    armed: bool,
}

impl InputFrame {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl FrameBuffer for InputFrame {
    fn capacity(&self) -> usize {
        self.pool.inputs[self.index].region.len()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        let region = &self.pool.inputs[self.index].region;
        // the slot's input belongs to this frame until it is filled or dropped
        unsafe { region.bytes_mut(0, region.len()) }
    }

    fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }
}

impl Drop for InputFrame {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_input(self.index);
        }
    }
}

impl std::fmt::Debug for InputFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputFrame")
            .field("index", &self.index)
            .field("camera", &self.camera)
            .field("len", &self.len)
            .finish()
    }
}

struct OutputLoan {
    pool: Arc<DecoderBufferPool>,
    index: usize,
    camera: CameraId,
    timestamp: u64,
    len: usize,
}

impl Drop for OutputLoan {
    fn drop(&mut self) {
        self.pool.release_output(self.index);
    }
}

/// A decoded NV12 frame lent to the consumer.
///
/// Clones share the loan; the buffer is recycled (or retired once the
/// session stops) when the last one is dropped.
#[derive(Clone)]
pub struct DecodedFrame(Arc<OutputLoan>);

impl DecodedFrame {
    pub fn camera(&self) -> CameraId {
        self.0.camera
    }

    /// Output buffer index (same as the input it was decoded from).
    pub fn index(&self) -> usize {
        self.0.index
    }

    /// Timestamp of the SOI PDU, in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        self.0.timestamp
    }

    pub fn width(&self) -> u32 {
        self.0.pool.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.0.pool.geometry.height
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// Decoded bytes.
    pub fn data(&self) -> &[u8] {
        let region = &self.0.pool.outputs[self.0.index].region;
        // the device does not touch an output while it is lent
        unsafe { region.bytes(0, self.0.len) }
    }

    /// Exported DMA-buf of the output buffer.
    pub fn dmabuf(&self) -> Option<BorrowedFd<'_>> {
        self.0.pool.outputs[self.0.index]
            .dmabuf
            .as_ref()
            .map(|fd| fd.as_fd())
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("camera", &self.0.camera)
            .field("index", &self.0.index)
            .field("timestamp", &self.0.timestamp)
            .field("len", &self.0.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::LoopbackDecoder;

    fn pool(cameras: usize, policy: AcquirePolicy) -> (Arc<LoopbackDecoder>, Arc<DecoderBufferPool>) {
        let config = DecoderConfig {
            width: 64,
            height: 32,
            max_frame_length: 4096,
            acquire_policy: policy,
            ..Default::default()
        };
        let device = Arc::new(LoopbackDecoder::new("loopback"));
        device.configure(&DecoderGeometry::from_config(&config)).unwrap();
        let pools = device.allocate(config.pool_size(cameras), false).unwrap();
        let pool = DecoderBufferPool::new(device.clone(), pools, &config, cameras).unwrap();
        pool.activate().unwrap();
        (device, pool)
    }

    fn fill(pool: &Arc<DecoderBufferPool>, camera: CameraId, len: usize, ts: u64) -> usize {
        let mut frame = pool.acquire_input(camera).unwrap();
        frame.as_mut_slice()[..len].fill(0xAA);
        frame.set_len(len);
        frame.set_timestamp(ts);
        let index = frame.index();
        pool.on_input_filled(frame).unwrap();
        index
    }

    fn take(pool: &Arc<DecoderBufferPool>) -> DecodedFrame {
        match pool.dequeue_completed().unwrap() {
            Dequeued::Frame(_, frame) => frame,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fifo_seeding() {
        let (_device, pool) = pool(2, AcquirePolicy::Drop);
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.free_inputs(CameraId(0)), 4);
        assert_eq!(pool.free_inputs(CameraId(1)), 4);

        let a = pool.acquire_input(CameraId(0)).unwrap();
        let b = pool.acquire_input(CameraId(1)).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 4);
        assert_eq!(a.capacity(), 4096);
        assert!(pool.acquire_input(CameraId(2)).is_none());

        // abandoned buffers go back to the tail
        drop(a);
        assert_eq!(pool.free_inputs(CameraId(0)), 4);
        let next = pool.acquire_input(CameraId(0)).unwrap();
        assert_eq!(next.index(), 1);
    }

    #[test]
    fn test_input_then_output() {
        let (device, pool) = pool(1, AcquirePolicy::Drop);

        // first fill: output is free from the start
        let index = fill(&pool, CameraId(0), 100, 42);
        assert_eq!(device.submissions(index), 1);
        assert_eq!(device.last_bytes_used(index), Some(100));

        let frame = take(&pool);
        assert_eq!(frame.index(), index);
        assert_eq!(frame.timestamp(), 42);
        assert_eq!(frame.len(), 64 * 32 * 3 / 2);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.queued(), 0);

        // input refilled while the output is still lent: no submission yet
        let mut refill = None;
        for _ in 0..4 {
            let mut input = pool.acquire_input(CameraId(0)).unwrap();
            if input.index() == index {
                input.set_len(50);
                pool.on_input_filled(input).unwrap();
                refill = Some(index);
                break;
            }
        }
        assert_eq!(refill, Some(index));
        assert_eq!(device.submissions(index), 1);

        // output comes back second: exactly one more submission
        drop(frame);
        assert_eq!(device.submissions(index), 2);
        assert_eq!(device.last_bytes_used(index), Some(50));
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.queued(), 1);
    }

    #[test]
    fn test_output_then_input() {
        let (device, pool) = pool(1, AcquirePolicy::Drop);
        let index = fill(&pool, CameraId(0), 10, 0);
        let frame = take(&pool);

        // output back first: nothing to submit
        drop(frame);
        assert_eq!(device.submissions(index), 1);

        let mut held = Vec::new();
        while let Some(input) = pool.acquire_input(CameraId(0)) {
            if input.index() == index {
                pool.on_input_filled(input).unwrap();
                break;
            }
            held.push(input);
        }
        assert_eq!(held.len(), 3);
        assert_eq!(device.submissions(index), 2);
        assert_eq!(pool.stats().submitted, 2);
        for other in &held {
            assert_eq!(device.submissions(other.index()), 0);
        }
    }

    #[test]
    fn test_consistency_fault() {
        let (device, pool) = pool(1, AcquirePolicy::Drop);
        fill(&pool, CameraId(0), 10, 0);
        device.mismatch_next();
        let err = pool.dequeue_completed().unwrap_err();
        assert!(matches!(err, IngestError::Consistency { input: 0, output: 1 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_submit_failure_stops_pool() {
        let (device, pool) = pool(1, AcquirePolicy::Block);
        device.fail_queue(true);

        let mut frame = pool.acquire_input(CameraId(0)).unwrap();
        frame.set_len(10);
        assert!(matches!(pool.on_input_filled(frame), Err(IngestError::Device { .. })));
        assert!(!pool.is_active());
        assert!(pool.fault().is_some());
        // producers no longer get buffers, even with the blocking policy
        assert!(pool.acquire_input(CameraId(0)).is_none());
        assert!(matches!(pool.dequeue_completed().unwrap(), Dequeued::Shutdown));
    }

    #[test]
    fn test_listener_on_refill() {
        let (_device, pool) = pool(1, AcquirePolicy::Drop);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        pool.set_input_listener(Some(Arc::new(move |camera| sink.lock().push(camera))));

        let held: Vec<_> = (0..4).map(|_| pool.acquire_input(CameraId(0)).unwrap()).collect();
        assert!(pool.acquire_input(CameraId(0)).is_none());

        let mut held = held.into_iter();
        drop(held.next());
        drop(held.next());
        // only the empty -> non-empty edge is reported
        assert_eq!(*calls.lock(), vec![CameraId(0)]);
    }

    #[test]
    fn test_try_acquire_never_waits() {
        let (_device, pool) = pool(2, AcquirePolicy::Block);
        let held: Vec<InputFrame> = (0..4)
            .map(|_| pool.try_acquire_input(CameraId(0)).unwrap())
            .collect();
        assert_eq!(pool.free_inputs(CameraId(0)), 0);

        // returns at once even though the pool would block
        assert!(pool.try_acquire_input(CameraId(0)).is_none());
        assert!(pool.try_acquire_input(CameraId(1)).is_some());

        drop(held);
        assert!(pool.try_acquire_input(CameraId(0)).is_some());
    }

    #[test]
    fn test_cannot_reactivate() {
        let (_device, pool) = pool(1, AcquirePolicy::Drop);
        assert!(pool.activate().is_err());
        assert!(pool.deactivate());
        assert!(!pool.deactivate());
        assert!(pool.activate().is_err());
        assert_eq!(pool.phase(), SessionPhase::Draining);
        pool.finish();
        assert_eq!(pool.phase(), SessionPhase::Stopped);
        assert!(pool.activate().is_err());
    }
}
