//! PDU producers and the per-camera fan-out.
//!
//! Anything that yields camera PDUs (the live network link, a capture file
//! replay) talks to a [`PduSink`]. The [`CameraSet`] sink routes each PDU to
//! the assembler of its camera.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::assembler::{AssemblerStats, DropReason, FrameAssembler, InputPool, PduOutcome};
use super::pdu::AVTP_HEADER_LEN;
use crate::camera::CameraId;
use crate::net::{StreamFilter, StreamHandler};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Consumer side of the two-method ingestion contract.
pub trait PduSink {
    /// Deliver one PDU (AVTP header included) captured at `timestamp` ns.
    fn pdu(&mut self, camera: CameraId, pdu: &[u8], timestamp: u64) -> PduOutcome;

    /// The producer has no more data.
    fn eos(&mut self);
}

/// One frame assembler per camera behind a [`PduSink`].
pub struct CameraSet<P: InputPool> {
    assemblers: Vec<FrameAssembler<P>>,
    eos: bool,
}

impl<P: InputPool + Clone> CameraSet<P> {
    /// Assemblers for cameras `0..cameras`, all drawing from `pool`.
    pub fn new(pool: P, cameras: usize) -> Self {
        let assemblers = (0..cameras)
            .map(|id| FrameAssembler::new(CameraId(id as u8), pool.clone()))
            .collect();
        Self {
            assemblers,
            eos: false,
        }
    }
}

impl<P: InputPool> CameraSet<P> {
    pub fn len(&self) -> usize {
        self.assemblers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblers.is_empty()
    }

    pub fn assembler(&self, camera: CameraId) -> Option<&FrameAssembler<P>> {
        self.assemblers.get(camera.index())
    }

    pub fn stats(&self, camera: CameraId) -> Option<AssemblerStats> {
        self.assembler(camera).map(|a| a.stats())
    }

    /// Whether end-of-stream was signalled and nothing arrived since.
    pub fn is_eos(&self) -> bool {
        self.eos
    }
}

impl<P: InputPool> PduSink for CameraSet<P> {
    fn pdu(&mut self, camera: CameraId, pdu: &[u8], timestamp: u64) -> PduOutcome {
        let Some(assembler) = self.assemblers.get_mut(camera.index()) else {
            return PduOutcome::Dropped(DropReason::UnknownCamera);
        };
        if self.eos {
            debug!("stream restarted after end-of-stream");
            self.eos = false;
        }
        assembler.pdu(pdu, timestamp)
    }

    fn eos(&mut self) {
        for assembler in &mut self.assemblers {
            assembler.reset();
        }
        if !self.eos {
            info!("End of stream");
        }
        self.eos = true;
    }
}

/// Live producer: drains one camera's ring into a shared sink.
pub struct CameraLink<S: PduSink> {
    camera: CameraId,
    sink: Arc<Mutex<S>>,
    ethertype: u16,
    throttle: LogThrottler,
}

impl<S: PduSink> CameraLink<S> {
    pub fn new(camera: CameraId, sink: Arc<Mutex<S>>, ethertype: u16) -> Self {
        Self {
            camera,
            sink,
            ethertype,
            throttle: LogThrottler::default(),
        }
    }
}

impl<S: PduSink + Send> StreamHandler for CameraLink<S> {
    fn dispatch(&mut self, filter: &StreamFilter) {
        let ring = filter.ring();

        while let Some(frame) = ring.read() {
            match frame.payload() {
                Some((ethertype, pdu)) if ethertype == self.ethertype => {
                    if pdu.len() < AVTP_HEADER_LEN {
                        warn_throttled!(
                            self.throttle,
                            "runt",
                            "camera-{}: frame too short ({} bytes)",
                            self.camera,
                            frame.data().len()
                        );
                    } else {
                        let outcome = self.sink.lock().pdu(self.camera, pdu, frame.timestamp_ns());
                        if outcome == PduOutcome::Dropped(DropReason::NoBuffer) {
                            // resumed once the decoder returns an input buffer
                            filter.suspend();
                        }
                    }
                }
                Some((ethertype, _)) => {
                    warn_throttled!(
                        self.throttle,
                        "ethertype",
                        "camera-{}: unexpected ethertype {:#06x}",
                        self.camera,
                        ethertype
                    );
                }
                None => {
                    warn_throttled!(
                        self.throttle,
                        "runt",
                        "camera-{}: frame too short ({} bytes)",
                        self.camera,
                        frame.data().len()
                    );
                }
            }

            ring.release(frame);

            if !filter.is_active() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avtp::assembler::tests::VecPool;
    use crate::avtp::pdu::build_pdu;
    use crate::net::ether::{build_frame, ETH_P_AVTP_EXPERIMENTAL};
    use crate::net::{MacAddr, PacketRing, Reactor, RingGeometry};
    use nix::poll::PollTimeout;

    const CAM_MAC: MacAddr = MacAddr::new([0x00, 0x1b, 0xc5, 0x00, 0x00, 0x01]);

    fn wire(seq: u8, payload: &[u8]) -> Vec<u8> {
        build_frame(
            MacAddr::BROADCAST,
            CAM_MAC,
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
    fn test_camera_set_routes() {
        let pool = VecPool::new(4, 1024);
        let mut set = CameraSet::new(pool.clone(), 2);
        assert_eq!(set.len(), 2);

        for (seq, chunk) in jpeg_chunks().iter().enumerate() {
            set.pdu(CameraId(1), &build_pdu(seq as u8, chunk), 5);
        }
        assert_eq!(pool.frames().len(), 1);
        assert_eq!(set.stats(CameraId(1)).unwrap().frames, 1);
        assert_eq!(set.stats(CameraId(0)).unwrap().pdus, 0);

        assert_eq!(
            set.pdu(CameraId(7), &build_pdu(0, &[0xFF, 0xD8, 0]), 0),
            PduOutcome::Dropped(DropReason::UnknownCamera)
        );
    }

    #[test]
    fn test_eos_abandons_partial_frames() {
        let pool = VecPool::new(4, 1024);
        let mut set = CameraSet::new(pool.clone(), 2);
        let chunks = jpeg_chunks();
        set.pdu(CameraId(0), &build_pdu(0, &chunks[0]), 0);
        assert!(set.assembler(CameraId(0)).unwrap().holds_buffer());

        set.eos();
        assert!(set.is_eos());
        assert!(!set.assembler(CameraId(0)).unwrap().holds_buffer());

        // the tail of the old frame is not a frame on its own
        set.pdu(CameraId(0), &build_pdu(1, &chunks[2]), 0);
        assert!(!set.is_eos());
        assert!(pool.frames().is_empty());
    }

    fn live_source(pool: &VecPool) -> (Reactor, Arc<Mutex<CameraSet<VecPool>>>) {
        let ring = PacketRing::anonymous(RingGeometry::new(8, 0, 1544).unwrap());
        let set = Arc::new(Mutex::new(CameraSet::new(pool.clone(), 1)));
        let link = CameraLink::new(CameraId(0), set.clone(), ETH_P_AVTP_EXPERIMENTAL);

        let mut reactor = Reactor::new().unwrap();
        reactor.add_source(CameraId(0), StreamFilter::new(ring), Box::new(link));
        reactor.handle().resume(CameraId(0), false);
        (reactor, set)
    }

    #[test]
    fn test_live_link_assembles() {
        let pool = VecPool::new(2, 1024);
        let (mut reactor, set) = live_source(&pool);
        let ring = reactor.filter(CameraId(0)).unwrap().ring();

        let chunks = jpeg_chunks();
        ring.inject(0, &wire(0, &chunks[0]), 1_000);
        // foreign traffic and a runt in between
        ring.inject(1, &build_frame(MacAddr::BROADCAST, CAM_MAC, None, 0x0800, &[0; 46]), 0);
        ring.inject(2, &wire(1, &chunks[1])[..30], 0);
        ring.inject(3, &wire(1, &chunks[1]), 2_000);
        ring.inject(4, &wire(2, &chunks[2]), 3_000);

        assert_eq!(reactor.run_once(PollTimeout::ZERO).unwrap(), Some(1));

        let frames = pool.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, chunks.concat());
        assert_eq!(frames[0].1, 1_000);
        assert_eq!(set.lock().stats(CameraId(0)).unwrap().discontinuities, 0);

        let ring = reactor.filter(CameraId(0)).unwrap().ring();
        assert_eq!(ring.rx_pending(), 0);
        assert!(ring.read().is_none());
    }

    #[test]
    fn test_live_link_backpressure() {
        let pool = VecPool::new(0, 1024);
        let (mut reactor, _set) = live_source(&pool);
        let chunks = jpeg_chunks();
        {
            let ring = reactor.filter(CameraId(0)).unwrap().ring();
            for (seq, chunk) in chunks.iter().enumerate() {
                ring.inject(seq, &wire(seq as u8, chunk), 0);
            }
        }

        reactor.run_once(PollTimeout::ZERO).unwrap();
        let filter = reactor.filter(CameraId(0)).unwrap();
        assert!(!filter.is_active());
        // the rest of the backlog waits in the ring
        assert_eq!(filter.ring().rx_pending(), 2);

        pool.state.lock().available = 1;
        reactor.handle().resume(CameraId(0), false);
        reactor.run_once(PollTimeout::ZERO).unwrap();
        // the SOI was dropped, so the rest cannot form a frame
        assert!(pool.frames().is_empty());
        assert_eq!(reactor.filter(CameraId(0)).unwrap().ring().rx_pending(), 0);
    }
}
