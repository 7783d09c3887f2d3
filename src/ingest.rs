//! Live camera ingestion.
//!
//! Wires one filtered packet ring per camera into a shared reactor thread,
//! feeds the assemblers from it, and resumes suspended cameras whenever the
//! decoder pool hands an input buffer back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::avtp::{AssemblerStats, CameraLink, CameraSet, InputPool, PduSink};
use crate::camera::CameraId;
use crate::config::IngestConfig;
use crate::decoder::{DecoderBufferPool, InputFrame};
use crate::error::{IngestError, Result};
use crate::net::{
    FilterSpec, NetInterface, PacketRing, Reactor, ReactorHandle, RingGeometry, StreamFilter,
};

/// Decoder inputs as seen from the reactor thread.
///
/// Acquisition never waits: an exhausted camera gets `NoBuffer`, its filter is
/// suspended and the pool listener resumes it once a buffer comes back.
#[derive(Clone)]
pub struct LiveInputs(Arc<DecoderBufferPool>);

impl InputPool for LiveInputs {
    type Buffer = InputFrame;

    fn acquire(&self, camera: CameraId) -> Option<InputFrame> {
        self.0.try_acquire_input(camera)
    }

    fn submit(&self, buffer: InputFrame) -> Result<()> {
        self.0.on_input_filled(buffer)
    }
}

type SharedCameras = Arc<Mutex<CameraSet<LiveInputs>>>;

/// Register one suspended source per ring, camera `i` on `rings[i]`.
fn build_reactor(
    rings: Vec<PacketRing>,
    ethertype: u16,
    pool: &Arc<DecoderBufferPool>,
) -> Result<(Reactor, SharedCameras, Vec<CameraId>)> {
    if rings.is_empty() || rings.len() > pool.cameras() {
        return Err(IngestError::Config(format!(
            "{} rings for a pool serving {} cameras",
            rings.len(),
            pool.cameras()
        )));
    }

    let mut reactor = Reactor::new()?;
    let set: SharedCameras = Arc::new(Mutex::new(CameraSet::new(
        LiveInputs(pool.clone()),
        rings.len(),
    )));

    let mut cameras = Vec::with_capacity(rings.len());
    for (id, ring) in rings.into_iter().enumerate() {
        let camera = CameraId(id as u8);
        let link = CameraLink::new(camera, set.clone(), ethertype);
        reactor.add_source(camera, StreamFilter::new(ring), Box::new(link));
        cameras.push(camera);
    }
    Ok((reactor, set, cameras))
}

/// Network side of the pipeline: cameras in, compressed frames to the pool.
pub struct LiveIngest {
    handle: ReactorHandle,
    worker: Option<JoinHandle<Result<()>>>,
    cameras: Vec<CameraId>,
    pool: Arc<DecoderBufferPool>,
    set: SharedCameras,
    streaming: Arc<AtomicBool>,
}

impl LiveIngest {
    /// Open one filtered ring per configured camera on the configured interface.
    pub fn open(config: &IngestConfig, pool: Arc<DecoderBufferPool>) -> Result<Self> {
        config.validate()?;
        let iface = NetInterface::open(&config.interface)?;
        let geometry = RingGeometry::from_config(&config.ring)?;

        let mut rings = Vec::with_capacity(config.cameras.len());
        for (id, camera) in config.cameras.iter().enumerate() {
            let mut spec = FilterSpec::new()
                .source(camera.source_mac)
                .ethertype(config.ethertype);
            if let Some(dest) = camera.dest_mac {
                spec = spec.dest(dest);
            }
            if let Some(vlan) = camera.vlan {
                spec = spec.vlan(vlan);
            }
            let ring = PacketRing::open(&iface, &spec, geometry)?;
            info!(
                "camera-{} ({}): listening for {} on '{}'",
                id,
                if camera.name.is_empty() { "unnamed" } else { camera.name.as_str() },
                camera.source_mac,
                iface.name()
            );
            rings.push(ring);
        }

        Self::with_rings(rings, config.ethertype, pool)
    }

    /// Build the ingestion thread over prepared rings, camera `i` on `rings[i]`.
    ///
    /// # Arguments
    ///
    /// * `rings` - one filtered ring per camera, in camera order
    /// * `ethertype` - ethertype carrying the camera streams
    /// * `pool` - decoder pool the assembled frames are submitted to
    pub fn with_rings(
        rings: Vec<PacketRing>,
        ethertype: u16,
        pool: Arc<DecoderBufferPool>,
    ) -> Result<Self> {
        let (mut reactor, set, cameras) = build_reactor(rings, ethertype, &pool)?;
        let handle = reactor.handle();
        let streaming = Arc::new(AtomicBool::new(false));

        {
            let handle = handle.clone();
            let streaming = streaming.clone();
            pool.set_input_listener(Some(Arc::new(move |camera| {
                if streaming.load(Ordering::Acquire) {
                    handle.resume(camera, false);
                }
            })));
        }

        let worker = thread::Builder::new()
            .name("avb-reactor".into())
            .spawn(move || {
                let result = reactor.run();
                if let Err(e) = &result {
                    warn!("Reactor failed: {}", e);
                }
                result
            })?;

        debug!("Live ingestion ready for {} cameras", cameras.len());
        Ok(Self {
            handle,
            worker: Some(worker),
            cameras,
            pool,
            set,
            streaming,
        })
    }

    pub fn cameras(&self) -> &[CameraId] {
        &self.cameras
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn stats(&self, camera: CameraId) -> Option<AssemblerStats> {
        self.set.lock().stats(camera)
    }

    /// Start delivering frames, discarding whatever queued up before.
    pub fn start(&self) -> Result<()> {
        if self.worker.is_none() {
            return Err(IngestError::InvalidState("ingestion is shut down"));
        }
        if self.streaming.swap(true, Ordering::AcqRel) {
            return Err(IngestError::InvalidState("already streaming"));
        }
        for camera in &self.cameras {
            self.handle.resume(*camera, true);
        }
        info!("Streaming started ({} cameras)", self.cameras.len());
        Ok(())
    }

    /// Stop watching the cameras; rings stay open.
    pub fn stop_streaming(&self) {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return;
        }
        for camera in &self.cameras {
            self.handle.suspend(*camera);
        }
        info!("Streaming stopped");
    }

    /// Stop the reactor thread and abandon partial frames.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.stop_streaming();
        self.pool.set_input_listener(None);
        self.handle.stop();

        let result = worker
            .join()
            .map_err(|_| IngestError::InvalidState("reactor thread panicked"))
            .and_then(|r| r);
        self.set.lock().eos();
        debug!("Live ingestion shut down");
        result
    }
}

impl Drop for LiveIngest {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Live ingestion shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avtp::pdu::build_pdu;
    use crate::config::{AcquirePolicy, DecoderConfig};
    use crate::decoder::testing::Collector;
    use crate::decoder::{DecoderSession, LoopbackDecoder};
    use crate::net::ether::{build_frame, ETH_P_AVTP_EXPERIMENTAL};
    use crate::net::MacAddr;
    use nix::poll::PollTimeout;
    use std::time::Duration;

    fn session(cameras: usize) -> DecoderSession {
        let config = DecoderConfig {
            width: 64,
            height: 32,
            max_frame_length: 4096,
            buffers_per_camera: 2,
            acquire_policy: AcquirePolicy::Drop,
            ..Default::default()
        };
        DecoderSession::new(
            Arc::new(LoopbackDecoder::new("loopback")),
            config,
            cameras,
            Arc::new(Collector::new(false)),
        )
    }

    fn ring() -> PacketRing {
        PacketRing::anonymous(RingGeometry::new(8, 0, 1544).unwrap())
    }

    #[test]
    fn test_start_twice() {
        let mut session = session(2);
        let pool = session.start().unwrap();
        let mut ingest =
            LiveIngest::with_rings(vec![ring(), ring()], ETH_P_AVTP_EXPERIMENTAL, pool).unwrap();
        assert_eq!(ingest.cameras(), &[CameraId(0), CameraId(1)]);
        assert!(!ingest.is_streaming());

        ingest.start().unwrap();
        assert!(matches!(ingest.start(), Err(IngestError::InvalidState(_))));
        ingest.stop_streaming();
        assert!(!ingest.is_streaming());
        ingest.start().unwrap();

        ingest.shutdown().unwrap();
        assert!(matches!(ingest.start(), Err(IngestError::InvalidState(_))));
        // idempotent
        ingest.shutdown().unwrap();
        session.stop().unwrap();
    }

    #[test]
    fn test_ring_count_checked() {
        let mut session = session(1);
        let pool = session.start().unwrap();
        assert!(LiveIngest::with_rings(vec![], ETH_P_AVTP_EXPERIMENTAL, pool.clone()).is_err());
        assert!(
            LiveIngest::with_rings(vec![ring(), ring()], ETH_P_AVTP_EXPERIMENTAL, pool).is_err()
        );
        session.stop().unwrap();
    }

    #[test]
    fn test_start_discards_backlog() {
        let mut session = session(1);
        let pool = session.start().unwrap();

        let ring = ring();
        let mut soi = vec![0x11; 40];
        soi[..2].copy_from_slice(&[0xFF, 0xD8]);
        let cam = MacAddr::new([0x00, 0x1b, 0xc5, 0x00, 0x00, 0x01]);
        for seq in 0..4u8 {
            let frame = build_frame(
                MacAddr::BROADCAST,
                cam,
                Some(0x56),
                ETH_P_AVTP_EXPERIMENTAL,
                &build_pdu(seq, &soi),
            );
            ring.inject(seq as usize, &frame, 0);
        }

        let mut ingest = LiveIngest::with_rings(vec![ring], ETH_P_AVTP_EXPERIMENTAL, pool).unwrap();
        ingest.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ingest.stats(CameraId(0)).unwrap().pdus, 0);

        ingest.shutdown().unwrap();
        session.stop().unwrap();
    }

    fn wire(seq: u8, payload: &[u8]) -> Vec<u8> {
        let cam = MacAddr::new([0x00, 0x1b, 0xc5, 0x00, 0x00, 0x01]);
        build_frame(
            MacAddr::BROADCAST,
            cam,
            Some(0x56),
            ETH_P_AVTP_EXPERIMENTAL,
            &build_pdu(seq, payload),
        )
    }

    fn jpeg_chunks() -> Vec<Vec<u8>> {
        let mut head = vec![0x22; 40];
        head[..2].copy_from_slice(&[0xFF, 0xD8]);
        let mut tail = vec![0x22; 40];
        tail[38..].copy_from_slice(&[0xFF, 0xD9]);
        vec![head, vec![0x22; 40], tail]
    }

    #[test]
    fn test_exhausted_camera_does_not_stall_others() {
        let consumer = Arc::new(Collector::new(true));
        let config = DecoderConfig {
            width: 64,
            height: 32,
            max_frame_length: 4096,
            buffers_per_camera: 1,
            // the live path must not wait even when the pool would
            acquire_policy: AcquirePolicy::Block,
            ..Default::default()
        };
        let mut session = DecoderSession::new(
            Arc::new(LoopbackDecoder::new("loopback")),
            config,
            2,
            consumer.clone(),
        );
        let pool = session.start().unwrap();
        let (mut reactor, set, cameras) =
            build_reactor(vec![ring(), ring()], ETH_P_AVTP_EXPERIMENTAL, &pool).unwrap();
        assert_eq!(cameras.len(), 2);

        let chunks = jpeg_chunks();
        {
            // camera 0: two frames and the start of a third
            let ring = reactor.filter(CameraId(0)).unwrap().ring();
            let mut seq = 0u8;
            for _ in 0..2 {
                for chunk in &chunks {
                    ring.inject(seq as usize, &wire(seq, chunk), 1_000);
                    seq += 1;
                }
            }
            ring.inject(seq as usize, &wire(seq, &chunks[0]), 1_000);

            // camera 1: one frame
            let ring = reactor.filter(CameraId(1)).unwrap().ring();
            for (seq, chunk) in chunks.iter().enumerate() {
                ring.inject(seq, &wire(seq as u8, chunk), 2_000);
            }
        }
        reactor.handle().resume(CameraId(0), false);
        reactor.handle().resume(CameraId(1), false);

        assert_eq!(reactor.run_once(PollTimeout::ZERO).unwrap(), Some(2));

        consumer.wait_frames(2);
        let mut delivered: Vec<CameraId> = consumer.frames().iter().map(|f| f.camera).collect();
        delivered.sort();
        assert_eq!(delivered, vec![CameraId(0), CameraId(1)]);

        let stats = set.lock().stats(CameraId(0)).unwrap();
        assert!(stats.no_buffer >= 1);
        assert!(!reactor.filter(CameraId(0)).unwrap().is_active());
        assert!(reactor.filter(CameraId(1)).unwrap().is_active());
        assert_eq!(set.lock().stats(CameraId(1)).unwrap().frames, 1);

        drop(reactor);
        drop(set);
        let stopper = thread::spawn(move || session.stop());
        thread::sleep(Duration::from_millis(50));
        consumer.release_all();
        stopper.join().unwrap().unwrap();
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut session = session(1);
        let pool = session.start().unwrap();
        let config = IngestConfig::default();
        assert!(matches!(
            LiveIngest::open(&config, pool),
            Err(IngestError::Config(_))
        ));
        session.stop().unwrap();
    }
}
