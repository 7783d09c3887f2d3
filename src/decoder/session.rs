//! Decoder session lifecycle.
//!
//! `Stopped -> Active -> Draining -> Stopped`. Starting maps the buffer pools
//! and launches the completion thread; stopping clears the activity flag,
//! wakes everyone blocked on the pool and waits until the consumer has
//! returned every decoded frame.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::device::{DecoderDevice, DecoderGeometry, FrameConsumer};
use super::pool::{DecoderBufferPool, Dequeued};
use crate::config::DecoderConfig;
use crate::error::{IngestError, Result};

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Stopped,
    Active,
    Draining,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Stopped => "stopped",
            SessionPhase::Active => "active",
            SessionPhase::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// One decoder device shared by all cameras.
pub struct DecoderSession {
    device: Arc<dyn DecoderDevice>,
    config: DecoderConfig,
    cameras: usize,
    consumer: Arc<dyn FrameConsumer>,
    pool: Option<Arc<DecoderBufferPool>>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl DecoderSession {
    pub fn new(
        device: Arc<dyn DecoderDevice>,
        config: DecoderConfig,
        cameras: usize,
        consumer: Arc<dyn FrameConsumer>,
    ) -> Self {
        Self {
            device,
            config,
            cameras,
            consumer,
            pool: None,
            worker: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.pool
            .as_ref()
            .map_or(SessionPhase::Stopped, |pool| pool.phase())
    }

    /// Pool of the running session.
    pub fn pool(&self) -> Option<&Arc<DecoderBufferPool>> {
        self.pool.as_ref()
    }

    /// Configure the device, map the pools and start decoding.
    pub fn start(&mut self) -> Result<Arc<DecoderBufferPool>> {
        if self.pool.is_some() {
            return Err(IngestError::InvalidState("decoder session already started"));
        }
        self.config.validate()?;
        if self.cameras == 0 || self.cameras > u8::MAX as usize {
            return Err(IngestError::Config(format!(
                "invalid camera count: {}",
                self.cameras
            )));
        }

        let geometry = DecoderGeometry::from_config(&self.config);
        self.device.configure(&geometry)?;
        let pools = self
            .device
            .allocate(self.config.pool_size(self.cameras), self.config.export_dmabuf)?;
        let pool = DecoderBufferPool::new(self.device.clone(), pools, &self.config, self.cameras)?;

        for info in pool.output_info() {
            self.consumer.allocate(&info)?;
        }

        pool.activate()?;

        let worker_pool = pool.clone();
        let consumer = self.consumer.clone();
        let worker = thread::Builder::new()
            .name("jpeg-decoder".to_string())
            .spawn(move || completion_loop(worker_pool, consumer));
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                pool.deactivate();
                pool.finish();
                return Err(e.into());
            }
        };

        info!(
            "Decoder '{}' started: {}x{}, {} buffers ({} cameras)",
            self.device.name(),
            geometry.width,
            geometry.height,
            pool.len(),
            self.cameras
        );

        self.pool = Some(pool.clone());
        self.worker = Some(worker);
        Ok(pool)
    }

    /// Stop decoding and wait until all decoded frames are returned.
    ///
    /// Returns the fatal error that ended the session, if any.
    pub fn stop(&mut self) -> Result<()> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        if pool.deactivate() {
            info!("Stopping decoder '{}'", self.device.name());
        }
        pool.wait_drained();

        let result = match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_else(|_| {
                Err(IngestError::device(
                    self.device.name(),
                    "completion thread panicked",
                ))
            }),
            None => Ok(()),
        };
        pool.finish();

        let stats = pool.stats();
        debug!(
            "Decoder '{}' stopped: {} submitted, {} delivered, {} discarded",
            self.device.name(),
            stats.submitted,
            stats.delivered,
            stats.discarded
        );

        match (result, pool.fault()) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(fault)) => Err(IngestError::device(self.device.name(), fault)),
            (Ok(()), None) => Ok(()),
        }
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Decoder session ended with error: {}", e);
        }
    }
}

/// Completion thread body: dequeue decoded pairs and hand them downstream.
fn completion_loop(pool: Arc<DecoderBufferPool>, consumer: Arc<dyn FrameConsumer>) -> Result<()> {
    debug!("Completion thread started");

    let result = loop {
        match pool.dequeue_completed() {
            Ok(Dequeued::Frame(camera, frame)) => {
                if let Err(e) = consumer.process(camera, frame) {
                    break Err(e);
                }
            }
            Ok(Dequeued::Discarded(index)) => {
                debug!(index, "decoded frame discarded");
            }
            Ok(Dequeued::Shutdown) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &result {
        pool.fail(e);
    }
    debug!("Completion thread terminated");
    result
}
