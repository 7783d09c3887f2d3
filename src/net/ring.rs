//! Zero-copy packet rings (`PACKET_MMAP`, `TPACKET_V2`).
//!
//! The kernel and user space share an array of fixed-size slots. Each slot
//! starts with a `tpacket2_hdr` whose status word says who owns it: the
//! kernel fills RX slots and flips them to `TP_STATUS_USER`; user space reads
//! them and hands them back with `TP_STATUS_KERNEL`. TX slots go the other way
//! with `TP_STATUS_AVAILABLE` / `TP_STATUS_SEND_REQUEST`.
//!
//! Slot counts are powers of two so cursors wrap with a mask.

use std::cell::Cell;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::ether::{self, EtherHeader};
use super::filter::{join_multicast, FilterSpec};
use super::NetInterface;
use crate::config::RingConfig;
use crate::error::{IngestError, Result};
use crate::utils::MemoryRegion;

const SOL_PACKET: libc::c_int = 263;
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;
const PACKET_TX_HAS_OFF: libc::c_int = 19;
const TPACKET_V2: libc::c_int = 1;

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1 << 0;
pub const TP_STATUS_COPY: u32 = 1 << 1;
pub const TP_STATUS_LOSING: u32 = 1 << 2;
pub const TP_STATUS_AVAILABLE: u32 = 0;
pub const TP_STATUS_SEND_REQUEST: u32 = 1 << 0;

const TPACKET_ALIGNMENT: usize = 16;
/// `TPACKET_ALIGN(sizeof(tpacket2_hdr)) + sizeof(sockaddr_ll)`
pub const TPACKET2_HDRLEN: usize = 32 + 20;

/// `struct tpacket2_hdr`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Tpacket2Hdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

/// `struct tpacket_req`
#[repr(C)]
#[derive(Debug, Default)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

/// `struct tpacket_stats`
#[repr(C)]
#[derive(Debug, Default)]
struct TpacketStats {
    tp_packets: u32,
    tp_drops: u32,
}

const fn tpacket_align(len: usize) -> usize {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Slot size for frames of up to `frame_size` bytes: header added, aligned,
/// then rounded up to a power of two.
pub fn slot_size(frame_size: usize) -> usize {
    tpacket_align(frame_size + TPACKET2_HDRLEN).next_power_of_two()
}

/// Ring geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub rx_slots: usize,
    pub tx_slots: usize,
    /// Slot size in bytes (see [`slot_size`]).
    pub slot_size: usize,
}

impl RingGeometry {
    pub fn new(rx_slots: usize, tx_slots: usize, frame_size: usize) -> Result<Self> {
        // zero is accepted: that direction is simply not set up
        for slots in [rx_slots, tx_slots] {
            if slots & slots.wrapping_sub(1) != 0 || slots > 1 << 15 {
                return Err(IngestError::Config(format!(
                    "invalid ring sizes: {}/{}",
                    rx_slots, tx_slots
                )));
            }
        }
        if rx_slots + tx_slots == 0 {
            return Err(IngestError::Config("ring has no slots".into()));
        }
        Ok(Self {
            rx_slots,
            tx_slots,
            slot_size: slot_size(frame_size),
        })
    }

    pub fn from_config(config: &RingConfig) -> Result<Self> {
        Self::new(
            config.rx_slots as usize,
            config.tx_slots as usize,
            config.frame_size as usize,
        )
    }

    /// Total bytes of the shared mapping (RX ring first, then TX).
    pub fn mapping_len(&self) -> usize {
        (self.rx_slots + self.tx_slots) * self.slot_size
    }
}

/// Kernel and local ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingStats {
    /// Packets received since the previous statistics read.
    pub packets: u32,
    /// Packets dropped by the kernel since the previous read.
    pub drops: u32,
    /// Frames delivered truncated to the slot size.
    pub truncated: u64,
}

/// A received frame, borrowed from its RX slot.
///
/// The slot stays user-owned until the frame is passed to
/// [`PacketRing::release`].
#[derive(Debug)]
pub struct RawFrame<'a> {
    index: usize,
    status: u32,
    wire_len: u32,
    timestamp_ns: u64,
    data: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Ring slot the frame lives in.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Captured bytes, starting with the link header.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Length of the frame on the wire.
    pub fn wire_len(&self) -> usize {
        self.wire_len as usize
    }

    /// Kernel receive timestamp in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn is_truncated(&self) -> bool {
        self.status & TP_STATUS_COPY != 0
    }

    /// The kernel dropped packets before this one was queued.
    pub fn is_losing(&self) -> bool {
        self.status & TP_STATUS_LOSING != 0
    }

    /// Decode the link header (802.1Q aware).
    pub fn header(&self) -> Option<EtherHeader> {
        ether::translate(self.data)
    }

    /// Ethertype and payload following the link header.
    pub fn payload(&self) -> Option<(u16, &'a [u8])> {
        let header = self.header()?;
        Some((header.ethertype, &self.data[header.payload_offset..]))
    }
}

/// A transmit slot obtained from [`PacketRing::get_tx_buffer`].
#[derive(Debug)]
pub struct TxFrame<'a> {
    index: usize,
    data: &'a mut [u8],
}

impl TxFrame<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Frame bytes, starting at the link header.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Memory-mapped RX/TX packet ring over a raw socket.
pub struct PacketRing {
    // mapping is released before the socket closes
    region: MemoryRegion,
    fd: Option<OwnedFd>,
    geometry: RingGeometry,
    rx_mask: usize,
    tx_mask: usize,
    rx_read: Cell<usize>,
    tx_write: Cell<usize>,
    /// RX slots handed out by `read` and not yet released.
    lent: Vec<Cell<bool>>,
    truncated: Cell<u64>,
}

impl PacketRing {
    /// Set up the rings on a packet socket and map them.
    ///
    /// # Arguments
    ///
    /// * `fd` - an unbound `AF_PACKET` socket
    /// * `geometry` - RX/TX slot layout of the shared mapping
    pub fn create(fd: OwnedFd, geometry: RingGeometry) -> Result<Self> {
        set_packet_opt(fd.as_fd(), PACKET_VERSION, &TPACKET_V2)?;
        // TX frames carry their own MAC offset
        set_packet_opt(fd.as_fd(), PACKET_TX_HAS_OFF, &(1 as libc::c_int))?;

        for (opt, slots, name) in [
            (PACKET_TX_RING, geometry.tx_slots, "tx"),
            (PACKET_RX_RING, geometry.rx_slots, "rx"),
        ] {
            if slots == 0 {
                continue;
            }
            // a single block holding every frame
            let req = TpacketReq {
                tp_block_size: (slots * geometry.slot_size) as u32,
                tp_block_nr: 1,
                tp_frame_size: geometry.slot_size as u32,
                tp_frame_nr: slots as u32,
            };
            debug!(
                "setup {}-buffer: {{b:{}, f:{}, fs:{}, bs:{}}}",
                name, req.tp_block_nr, req.tp_frame_nr, req.tp_frame_size, req.tp_block_size
            );
            set_packet_opt(fd.as_fd(), opt, &req)?;
        }

        let region = MemoryRegion::map_shared(fd.as_fd(), geometry.mapping_len(), 0)?;
        let ring = Self::with_region(region, Some(fd), geometry);

        info!(
            "Packet ring mapped: rx:{}, tx:{}, slot:{} bytes",
            geometry.rx_slots, geometry.tx_slots, geometry.slot_size
        );
        Ok(ring)
    }

    /// Open a filtered raw socket on `iface` and set up its rings.
    ///
    /// The filter is installed before the ring exists and the socket is bound
    /// last, so no unfiltered frame ever reaches the ring.
    ///
    /// # Arguments
    ///
    /// * `iface` - interface to bind to
    /// * `filter` - stream selection compiled into the socket filter
    /// * `geometry` - RX/TX slot layout of the shared mapping
    pub fn open(iface: &NetInterface, filter: &FilterSpec, geometry: RingGeometry) -> Result<Self> {
        let fd = socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )?;

        filter.compile().attach(fd.as_fd())?;
        if let Some(group) = filter.multicast_group() {
            // reception still works when the switch floods the group
            if let Err(e) = join_multicast(fd.as_fd(), iface.index(), group) {
                warn!("Failed to join multicast group {}: {}", group, e);
            }
        }

        let ring = Self::create(fd, geometry)?;
        ring.bind(iface.index())?;

        debug!("Data stream on '{}' created", iface.name());
        Ok(ring)
    }

    /// Build a ring over an existing region (no socket when `fd` is `None`).
    pub fn with_region(region: MemoryRegion, fd: Option<OwnedFd>, geometry: RingGeometry) -> Self {
        let ring = Self {
            region,
            fd,
            geometry,
            rx_mask: geometry.rx_slots.wrapping_sub(1),
            tx_mask: geometry.tx_slots.wrapping_sub(1),
            rx_read: Cell::new(0),
            tx_write: Cell::new(0),
            lent: (0..geometry.rx_slots).map(|_| Cell::new(false)).collect(),
            truncated: Cell::new(0),
        };

        // TX frames use the same MAC offset as received ones
        let mac_offset = tpacket_align(TPACKET2_HDRLEN) as u16;
        for idx in 0..geometry.tx_slots {
            let hdr = ring.tx_slot(idx) as *mut Tpacket2Hdr;
            unsafe { ptr::addr_of_mut!((*hdr).tp_mac).write(mac_offset) };
        }
        ring
    }

    /// Ring backed by process memory, for driving the ring without a socket.
    pub fn anonymous(geometry: RingGeometry) -> Self {
        Self::with_region(MemoryRegion::anonymous(geometry.mapping_len()), None, geometry)
    }

    fn bind(&self, ifindex: u32) -> Result<()> {
        let Some(fd) = &self.fd else {
            return Ok(());
        };
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        Errno::result(ret)?;
        Ok(())
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    /// Socket descriptor, for readiness polling.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn rx_slot(&self, idx: usize) -> *mut u8 {
        unsafe { self.region.as_ptr().add(idx * self.geometry.slot_size) }
    }

    fn tx_slot(&self, idx: usize) -> *mut u8 {
        unsafe {
            self.region
                .as_ptr()
                .add((self.geometry.rx_slots + idx) * self.geometry.slot_size)
        }
    }

    /// Status word of a slot in this ring.
    fn status(&self, slot: *mut u8) -> &AtomicU32 {
        // tp_status is the first word of a slot; slots are at least 64-byte aligned
        unsafe { &*(slot as *const AtomicU32) }
    }

    fn rx_status(&self, idx: usize) -> u32 {
        self.status(self.rx_slot(idx)).load(Ordering::Acquire)
    }

    /// Whether the slot at the read cursor holds a frame.
    pub fn rx_ready(&self) -> bool {
        self.geometry.rx_slots > 0 && self.rx_status(self.rx_read.get()) & TP_STATUS_USER != 0
    }

    /// Number of consecutive user-owned slots from the read cursor.
    ///
    /// Telemetry only; the cursor does not move.
    pub fn rx_pending(&self) -> usize {
        if self.geometry.rx_slots == 0 {
            return 0;
        }
        let mut idx = self.rx_read.get();
        let mut count = 0;
        while count < self.geometry.rx_slots && self.rx_status(idx) & TP_STATUS_USER != 0 {
            count += 1;
            idx = (idx + 1) & self.rx_mask;
        }
        count
    }

    /// Take the frame at the read cursor, if the kernel has filled it.
    ///
    /// Never blocks.
    pub fn read(&self) -> Option<RawFrame<'_>> {
        if self.geometry.rx_slots == 0 {
            return None;
        }
        let idx = self.rx_read.get();
        let slot = self.rx_slot(idx);
        let status = self.status(slot).load(Ordering::Acquire);
        if status & TP_STATUS_USER == 0 {
            return None;
        }

        let hdr = unsafe { ptr::read(slot as *const Tpacket2Hdr) };
        if status & TP_STATUS_COPY != 0 {
            self.truncated.set(self.truncated.get() + 1);
            warn!("truncated frame (length={})", hdr.tp_len);
        }
        // wrap-around is where the kernel reports losses
        if idx == 0 && status & TP_STATUS_LOSING != 0 {
            if let Some(stats) = self.kernel_stats() {
                warn!("packets: {} (dropped: {})", stats.tp_packets, stats.tp_drops);
            }
        }

        let data = unsafe { self.region_bytes(idx, hdr.tp_mac as usize, hdr.tp_snaplen as usize) };
        self.lent[idx].set(true);
        self.rx_read.set((idx + 1) & self.rx_mask);

        Some(RawFrame {
            index: idx,
            status,
            wire_len: hdr.tp_len,
            timestamp_ns: hdr.tp_sec as u64 * 1_000_000_000 + hdr.tp_nsec as u64,
            data,
        })
    }

    /// Bytes of RX slot `idx` at `offset`, clamped to the slot.
    unsafe fn region_bytes(&self, idx: usize, offset: usize, len: usize) -> &[u8] {
        let slot_size = self.geometry.slot_size;
        let offset = offset.min(slot_size);
        let len = len.min(slot_size - offset);
        self.region.bytes(idx * slot_size + offset, len)
    }

    /// Return a frame's slot to the kernel.
    pub fn release(&self, frame: RawFrame<'_>) {
        self.release_slot(frame.index);
    }

    /// Return RX slot `idx` to the kernel if it was handed out by `read`.
    ///
    /// Slots that were never read, or were already released, are left alone.
    pub fn release_slot(&self, idx: usize) -> bool {
        match self.lent.get(idx) {
            Some(lent) if lent.get() => {
                lent.set(false);
                self.status(self.rx_slot(idx)).store(TP_STATUS_KERNEL, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Hand every ready slot back to the kernel.
    ///
    /// Runs twice: at stream start a slot may still be mid-fill while the
    /// first pass walks past it.
    pub fn purge(&self) -> usize {
        if self.geometry.rx_slots == 0 {
            return 0;
        }
        let mut purged = 0;
        for _ in 0..2 {
            purged += self.purge_pass(purged);
        }
        if purged > 0 {
            debug!("Purged {} stale frames", purged);
        }
        purged
    }

    /// One sweep from the read cursor; stops at a kernel-owned or lent slot.
    ///
    /// `done` counts slots already purged by earlier passes so a full ring is
    /// walked at most once.
    fn purge_pass(&self, done: usize) -> usize {
        // resets the kernel counters
        let _ = self.kernel_stats();
        let mut idx = self.rx_read.get();
        let mut purged = 0;
        while done + purged < self.geometry.rx_slots
            && self.rx_status(idx) & TP_STATUS_USER != 0
            && !self.lent[idx].get()
        {
            self.status(self.rx_slot(idx)).store(TP_STATUS_KERNEL, Ordering::Release);
            idx = (idx + 1) & self.rx_mask;
            purged += 1;
        }
        self.rx_read.set(idx);
        purged
    }

    /// Block until the slot at the read cursor holds a frame.
    pub fn wait_rx(&self) -> Result<()> {
        while !self.rx_ready() {
            let Some(fd) = self.fd() else {
                return Err(IngestError::Config("ring has no socket to wait on".into()));
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(IngestError::Sys(Errno::EPIPE));
            }
        }
        Ok(())
    }

    /// Claim the next free TX slot.
    ///
    /// With `wait` the call blocks until the kernel has sent the frame that
    /// occupied the slot; otherwise `None` is returned.
    pub fn get_tx_buffer(&self, wait: bool) -> Result<Option<TxFrame<'_>>> {
        if self.geometry.tx_slots == 0 {
            return Err(IngestError::Config("ring has no TX slots".into()));
        }
        let idx = self.tx_write.get();
        let slot = self.tx_slot(idx);

        while self.status(slot).load(Ordering::Acquire) != TP_STATUS_AVAILABLE {
            if !wait {
                return Ok(None);
            }
            let Some(fd) = self.fd() else {
                return Ok(None);
            };
            let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Err(IngestError::Sys(Errno::EPIPE));
            }
        }

        self.tx_write.set((idx + 1) & self.tx_mask);

        let hdr = unsafe { ptr::read(slot as *const Tpacket2Hdr) };
        let offset = (self.geometry.rx_slots + idx) * self.geometry.slot_size + hdr.tp_mac as usize;
        let len = self.geometry.slot_size.saturating_sub(hdr.tp_mac as usize);
        // the slot is ours until write() hands it back
        let data = unsafe { self.region.bytes_mut(offset, len) };
        Ok(Some(TxFrame { index: idx, data }))
    }

    /// Queue a TX frame of `len` bytes (link header included).
    ///
    /// With `commit` the kernel is kicked to transmit immediately.
    pub fn write(&self, frame: TxFrame<'_>, len: usize, commit: bool) -> Result<()> {
        if len > frame.capacity() {
            return Err(IngestError::Config(format!(
                "frame of {} bytes exceeds TX slot capacity {}",
                len,
                frame.capacity()
            )));
        }
        let slot = self.tx_slot(frame.index);
        let hdr = slot as *mut Tpacket2Hdr;
        unsafe { ptr::addr_of_mut!((*hdr).tp_len).write(len as u32) };
        self.status(slot).store(TP_STATUS_SEND_REQUEST, Ordering::Release);

        if commit {
            if let Some(fd) = &self.fd {
                let ret = unsafe {
                    libc::send(fd.as_raw_fd(), ptr::null(), 0, libc::MSG_DONTWAIT)
                };
                Errno::result(ret)?;
            }
        }
        Ok(())
    }

    /// Read (and thereby reset) the kernel counters.
    pub fn stats(&self) -> RingStats {
        let kernel = self.kernel_stats().unwrap_or_default();
        RingStats {
            packets: kernel.tp_packets,
            drops: kernel.tp_drops,
            truncated: self.truncated.get(),
        }
    }

    fn kernel_stats(&self) -> Option<TpacketStats> {
        let fd = self.fd.as_ref()?;
        let mut stats = TpacketStats::default();
        let mut len = mem::size_of::<TpacketStats>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut TpacketStats as *mut libc::c_void,
                &mut len,
            )
        };
        (ret == 0).then_some(stats)
    }

    /// Play the kernel: fill RX slot `idx` with `frame` and mark it user-owned.
    #[cfg(test)]
    pub(crate) fn inject(&self, idx: usize, frame: &[u8], timestamp_ns: u64) {
        let mac = tpacket_align(TPACKET2_HDRLEN);
        let room = self.geometry.slot_size - mac;
        let snap = frame.len().min(room);
        let slot = self.rx_slot(idx);
        let hdr = Tpacket2Hdr {
            tp_status: TP_STATUS_KERNEL,
            tp_len: frame.len() as u32,
            tp_snaplen: snap as u32,
            tp_mac: mac as u16,
            tp_net: (mac + ether::ETH_HLEN) as u16,
            tp_sec: (timestamp_ns / 1_000_000_000) as u32,
            tp_nsec: (timestamp_ns % 1_000_000_000) as u32,
            tp_vlan_tci: 0,
            tp_vlan_tpid: 0,
            tp_padding: [0; 4],
        };
        unsafe {
            ptr::write(slot as *mut Tpacket2Hdr, hdr);
            ptr::copy_nonoverlapping(frame.as_ptr(), slot.add(mac), snap);
        }
        let status = if snap < frame.len() {
            TP_STATUS_USER | TP_STATUS_COPY
        } else {
            TP_STATUS_USER
        };
        self.status(slot).store(status, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn slot_status(&self, idx: usize) -> u32 {
        self.rx_status(idx)
    }

    #[cfg(test)]
    pub(crate) fn tx_status(&self, idx: usize) -> u32 {
        self.status(self.tx_slot(idx)).load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PacketRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRing")
            .field("geometry", &self.geometry)
            .field("rx_read", &self.rx_read.get())
            .field("tx_write", &self.tx_write.get())
            .finish()
    }
}

fn set_packet_opt<T>(fd: BorrowedFd<'_>, opt: libc::c_int, value: &T) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_PACKET,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(rx: usize, tx: usize) -> PacketRing {
        PacketRing::anonymous(RingGeometry::new(rx, tx, 1544).unwrap())
    }

    #[test]
    fn test_geometry() {
        assert_eq!(slot_size(1544), 2048);
        assert_eq!(slot_size(1000), 2048);
        assert_eq!(slot_size(900), 1024);
        assert!(RingGeometry::new(48, 0, 1544).is_err());
        assert!(RingGeometry::new(0, 0, 1544).is_err());
        assert!(RingGeometry::new(0, 8, 1544).is_ok());
        assert_eq!(RingGeometry::new(64, 0, 1544).unwrap().mapping_len(), 64 * 2048);
    }

    #[test]
    fn test_read_release() {
        let ring = ring(4, 0);
        assert!(ring.read().is_none());

        ring.inject(0, &[0xAB; 60], 1_500_000_000);
        ring.inject(1, &[0xCD; 70], 0);
        assert_eq!(ring.rx_pending(), 2);

        let frame = ring.read().unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.data(), &[0xAB; 60][..]);
        assert_eq!(frame.timestamp_ns(), 1_500_000_000);
        assert!(!frame.is_truncated());
        ring.release(frame);
        assert_eq!(ring.slot_status(0), TP_STATUS_KERNEL);

        let frame = ring.read().unwrap();
        assert_eq!(frame.wire_len(), 70);
        ring.release(frame);

        assert!(ring.read().is_none());
        assert_eq!(ring.rx_pending(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        for slots in [1usize, 2, 8, 64] {
            let ring = ring(slots, 0);
            ring.inject(0, &[1; 20], 0);

            // not handed out yet: nothing happens
            assert!(!ring.release_slot(0));
            assert_eq!(ring.slot_status(0), TP_STATUS_USER);

            let frame = ring.read().unwrap();
            let idx = frame.index();
            ring.release(frame);
            assert!(!ring.release_slot(idx));
            assert_eq!(ring.slot_status(idx), TP_STATUS_KERNEL);

            // never more frames than user-owned slots
            for _ in 0..slots + 1 {
                assert!(ring.read().is_none());
            }
        }
    }

    #[test]
    fn test_wraparound() {
        let ring = ring(4, 0);
        for round in 0..3u8 {
            for idx in 0..4 {
                ring.inject(idx, &[round; 30], 0);
            }
            assert_eq!(ring.rx_pending(), 4);
            for idx in 0..4 {
                let frame = ring.read().unwrap();
                assert_eq!(frame.index(), idx);
                assert_eq!(frame.data()[0], round);
                ring.release(frame);
            }
            assert!(ring.read().is_none());
        }
    }

    #[test]
    fn test_truncated_frame() {
        let ring = ring(2, 0);
        ring.inject(0, &[7; 3000], 0);
        let frame = ring.read().unwrap();
        assert!(frame.is_truncated());
        assert_eq!(frame.wire_len(), 3000);
        assert_eq!(frame.data().len(), 2048 - 64);
        ring.release(frame);
        assert_eq!(ring.stats().truncated, 1);
    }

    #[test]
    fn test_purge() {
        let ring = ring(8, 0);
        for idx in 0..5 {
            ring.inject(idx, &[0; 20], 0);
        }
        assert_eq!(ring.purge(), 5);
        assert!(ring.read().is_none());
        for idx in 0..5 {
            assert_eq!(ring.slot_status(idx), TP_STATUS_KERNEL);
        }

        // purge resumes from the cursor it left behind
        ring.inject(5, &[9; 20], 0);
        let frame = ring.read().unwrap();
        assert_eq!(frame.index(), 5);
        ring.release(frame);
    }

    #[test]
    fn test_purge_second_pass() {
        let ring = ring(8, 0);
        for idx in 0..3 {
            ring.inject(idx, &[0; 20], 0);
        }
        assert_eq!(ring.purge_pass(0), 3);

        // filled by the kernel after the first sweep walked past it
        ring.inject(3, &[1; 20], 0);
        assert_eq!(ring.purge_pass(3), 1);
        assert_eq!(ring.slot_status(3), TP_STATUS_KERNEL);
        assert!(ring.read().is_none());
        assert_eq!(ring.rx_pending(), 0);

        ring.inject(4, &[2; 20], 0);
        assert_eq!(ring.read().unwrap().index(), 4);
    }

    #[test]
    fn test_purge_keeps_lent_slot() {
        let ring = ring(4, 0);
        for idx in 0..4 {
            ring.inject(idx, &[idx as u8; 20], 0);
        }
        let held = ring.read().unwrap();
        assert_eq!(held.index(), 0);

        // sweeps 1..3 and stops at the wrapped, still lent slot 0
        assert_eq!(ring.purge(), 3);
        assert_eq!(ring.slot_status(0) & TP_STATUS_USER, TP_STATUS_USER);
        for idx in 1..4 {
            assert_eq!(ring.slot_status(idx), TP_STATUS_KERNEL);
        }
        assert_eq!(held.data(), &[0; 20][..]);

        ring.release(held);
        assert_eq!(ring.slot_status(0), TP_STATUS_KERNEL);
        assert!(ring.read().is_none());
    }

    #[test]
    fn test_tx_path() {
        let ring = ring(2, 2);
        assert_eq!(ring.tx_status(0), TP_STATUS_AVAILABLE);

        let mut frame = ring.get_tx_buffer(false).unwrap().unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.capacity(), 2048 - 64);
        frame.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        ring.write(frame, 60, true).unwrap();
        assert_eq!(ring.tx_status(0), TP_STATUS_SEND_REQUEST);

        let frame = ring.get_tx_buffer(false).unwrap().unwrap();
        assert_eq!(frame.index(), 1);
        ring.write(frame, 60, false).unwrap();

        // both slots pending transmission
        assert!(ring.get_tx_buffer(false).unwrap().is_none());
    }
}
