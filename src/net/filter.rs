//! Classic packet filter synthesis.
//!
//! Each camera stream gets its own socket with a kernel filter matching any
//! subset of {destination MAC, source MAC, ethertype, VLAN}. The predicates
//! are ANDed; a frame failing any of them jumps to the final reject.
//!
//! The program is equivalent to
//! `ether dst D and ether src S and (ether proto P or (vlan V and ether proto P))`
//! with absent predicates left out. An untagged frame of the requested
//! ethertype is accepted without a VLAN check.

use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use super::MacAddr;
use crate::error::Result;

/// `BPF_LD | BPF_W | BPF_ABS`
pub const BPF_LD_W_ABS: u16 = 0x20;
/// `BPF_LD | BPF_H | BPF_ABS`
pub const BPF_LD_H_ABS: u16 = 0x28;
/// `BPF_JMP | BPF_JEQ | BPF_K`
pub const BPF_JEQ_K: u16 = 0x15;
/// `BPF_ALU | BPF_AND | BPF_K`
pub const BPF_AND_K: u16 = 0x54;
/// `BPF_RET | BPF_K`
pub const BPF_RET_K: u16 = 0x06;

/// Snap length returned by the accept instruction.
pub const ACCEPT_LEN: u32 = 0xFFFF;

/// Placeholder jump offset patched to "reject" once the program is complete.
const TO_REJECT: u8 = 0xFF;

/// One classic BPF instruction (layout of `struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl BpfInsn {
    const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }
}

/// Stream selection criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub dest_mac: Option<MacAddr>,
    pub source_mac: Option<MacAddr>,
    pub ethertype: Option<u16>,
    pub vlan: Option<u16>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dest(mut self, mac: MacAddr) -> Self {
        self.dest_mac = Some(mac);
        self
    }

    pub fn source(mut self, mac: MacAddr) -> Self {
        self.source_mac = Some(mac);
        self
    }

    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.ethertype = Some(ethertype).filter(|&t| t != 0);
        self
    }

    pub fn vlan(mut self, vlan: u16) -> Self {
        self.vlan = Some(vlan).filter(|&v| v != 0);
        self
    }

    /// Multicast group to join for the destination address, if any.
    pub fn multicast_group(&self) -> Option<MacAddr> {
        self.dest_mac.filter(MacAddr::is_multicast)
    }

    /// Synthesize the filter program.
    pub fn compile(&self) -> BpfProgram {
        let mut prog = Vec::with_capacity(18);

        if let Some(da) = self.dest_mac {
            prog.push(BpfInsn::new(BPF_LD_W_ABS, 0, 0, 2));
            prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, da.low32()));
            prog.push(BpfInsn::new(BPF_LD_H_ABS, 0, 0, 0));
            prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, da.high16() as u32));
        }

        if let Some(sa) = self.source_mac {
            prog.push(BpfInsn::new(BPF_LD_W_ABS, 0, 0, 8));
            prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, sa.low32()));
            prog.push(BpfInsn::new(BPF_LD_H_ABS, 0, 0, 6));
            prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, sa.high16() as u32));
        }

        if self.ethertype.is_some() || self.vlan.is_some() {
            prog.push(BpfInsn::new(BPF_LD_H_ABS, 0, 0, 12));

            if let Some(proto) = self.ethertype {
                // untagged match skips straight to accept
                let skip = if self.vlan.is_some() { 6 } else { 3 };
                prog.push(BpfInsn::new(BPF_JEQ_K, skip, 0, proto as u32));
            }

            prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, 0x8100));

            if let Some(vlan) = self.vlan {
                prog.push(BpfInsn::new(BPF_LD_H_ABS, 0, 0, 14));
                prog.push(BpfInsn::new(BPF_AND_K, 0, 0, 0x0FFF));
                prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, vlan as u32));
            }

            if let Some(proto) = self.ethertype {
                prog.push(BpfInsn::new(BPF_LD_H_ABS, 0, 0, 16));
                prog.push(BpfInsn::new(BPF_JEQ_K, 0, TO_REJECT, proto as u32));
            }
        }

        prog.push(BpfInsn::new(BPF_RET_K, 0, 0, ACCEPT_LEN));
        prog.push(BpfInsn::new(BPF_RET_K, 0, 0, 0));

        // jump offsets are relative to the next instruction; reject is last
        let len = prog.len();
        for (pc, insn) in prog.iter_mut().enumerate().take(len - 2) {
            let to_reject = (len - 2 - pc) as u8;
            if insn.jt == TO_REJECT {
                insn.jt = to_reject;
            }
            if insn.jf == TO_REJECT {
                insn.jf = to_reject;
            }
        }

        BpfProgram { insns: prog }
    }
}

/// A compiled filter program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfProgram {
    insns: Vec<BpfInsn>,
}

impl BpfProgram {
    pub fn instructions(&self) -> &[BpfInsn] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Evaluate the program against a frame with kernel semantics.
    ///
    /// Returns the number of bytes to keep; 0 drops the frame. Loads beyond
    /// the end of the frame abort with 0, as the kernel does.
    pub fn run(&self, frame: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0usize;

        while let Some(insn) = self.insns.get(pc) {
            let k = insn.k as usize;
            match insn.code {
                BPF_LD_W_ABS => match frame.get(k..k + 4) {
                    Some(b) => acc = u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                    None => return 0,
                },
                BPF_LD_H_ABS => match frame.get(k..k + 2) {
                    Some(b) => acc = u16::from_be_bytes([b[0], b[1]]) as u32,
                    None => return 0,
                },
                BPF_AND_K => acc &= insn.k,
                BPF_JEQ_K => {
                    let off = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += off as usize;
                }
                BPF_RET_K => return insn.k,
                code => {
                    warn!("Unsupported filter opcode {:#06x}", code);
                    return 0;
                }
            }
            pc += 1;
        }
        0
    }

    pub fn accepts(&self, frame: &[u8]) -> bool {
        self.run(frame) != 0
    }

    /// Install the program on a socket (`SO_ATTACH_FILTER`).
    pub fn attach(&self, fd: BorrowedFd<'_>) -> Result<()> {
        for (pc, insn) in self.insns.iter().enumerate() {
            trace!(
                "prog[{}]: {:04X}, {:02X}, {:02X}, {:08X}",
                pc,
                insn.code,
                insn.jt,
                insn.jf,
                insn.k
            );
        }

        let mut filter: Vec<libc::sock_filter> = self
            .insns
            .iter()
            .map(|i| libc::sock_filter {
                code: i.code,
                jt: i.jt,
                jf: i.jf,
                k: i.k,
            })
            .collect();
        let fprog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_mut_ptr(),
        };

        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const libc::sock_fprog as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        Errno::result(ret)?;

        debug!("Packet filter attached ({} instructions)", self.insns.len());
        Ok(())
    }
}

/// Add the socket to a link-layer multicast group.
pub fn join_multicast(fd: BorrowedFd<'_>, ifindex: u32, group: MacAddr) -> Result<()> {
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex as libc::c_int;
    mreq.mr_type = libc::PACKET_MR_MULTICAST as libc::c_ushort;
    mreq.mr_alen = 6;
    mreq.mr_address[..6].copy_from_slice(&group.octets());

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    Errno::result(ret)?;

    debug!("Joined multicast group {}", group);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ether::{build_frame, ETH_P_AVTP_EXPERIMENTAL};

    const CAMERA: MacAddr = MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const OTHER: MacAddr = MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);
    const GROUP: MacAddr = MacAddr::new([0x91, 0xE0, 0xF0, 0x00, 0xFE, 0x00]);

    fn frame(dest: MacAddr, source: MacAddr, vlan: Option<u16>, ethertype: u16) -> Vec<u8> {
        build_frame(dest, source, vlan, ethertype, &[0u8; 32])
    }

    #[test]
    fn test_empty_spec_accepts_all() {
        let prog = FilterSpec::new().compile();
        assert_eq!(prog.len(), 2);
        assert!(prog.accepts(&frame(GROUP, OTHER, None, 0x0800)));
        assert_eq!(prog.run(&[]), ACCEPT_LEN);
    }

    #[test]
    fn test_ethertype_only() {
        let prog = FilterSpec::new().ethertype(ETH_P_AVTP_EXPERIMENTAL).compile();

        for (dest, source) in [(GROUP, CAMERA), (MacAddr::BROADCAST, OTHER), (CAMERA, GROUP)] {
            assert!(prog.accepts(&frame(dest, source, None, ETH_P_AVTP_EXPERIMENTAL)));
            for vlan in [1, 0x56, 0xFFF] {
                assert!(prog.accepts(&frame(dest, source, Some(vlan), ETH_P_AVTP_EXPERIMENTAL)));
                assert!(!prog.accepts(&frame(dest, source, Some(vlan), 0x0800)));
            }
            for ethertype in [0x0800, 0x86DD, 0x22F0, 0x88F7] {
                assert!(!prog.accepts(&frame(dest, source, None, ethertype)));
            }
        }
    }

    #[test]
    fn test_full_camera_filter() {
        let prog = FilterSpec::new()
            .dest(GROUP)
            .source(CAMERA)
            .ethertype(ETH_P_AVTP_EXPERIMENTAL)
            .vlan(0x56)
            .compile();
        assert_eq!(prog.len(), 18);

        assert!(prog.accepts(&frame(GROUP, CAMERA, Some(0x56), ETH_P_AVTP_EXPERIMENTAL)));
        assert!(prog.accepts(&frame(GROUP, CAMERA, None, ETH_P_AVTP_EXPERIMENTAL)));
        assert!(!prog.accepts(&frame(GROUP, CAMERA, Some(0x57), ETH_P_AVTP_EXPERIMENTAL)));
        assert!(!prog.accepts(&frame(GROUP, OTHER, Some(0x56), ETH_P_AVTP_EXPERIMENTAL)));
        assert!(!prog.accepts(&frame(MacAddr::BROADCAST, CAMERA, Some(0x56), ETH_P_AVTP_EXPERIMENTAL)));
        assert!(!prog.accepts(&frame(GROUP, CAMERA, Some(0x56), 0x0800)));
    }

    #[test]
    fn test_vlan_only_requires_tag() {
        let prog = FilterSpec::new().vlan(0x56).compile();
        assert!(prog.accepts(&frame(GROUP, CAMERA, Some(0x56), 0x0800)));
        assert!(!prog.accepts(&frame(GROUP, CAMERA, Some(0x10), 0x0800)));
        assert!(!prog.accepts(&frame(GROUP, CAMERA, None, 0x0800)));
    }

    #[test]
    fn test_reject_offsets_land_on_reject() {
        let prog = FilterSpec::new()
            .source(CAMERA)
            .ethertype(ETH_P_AVTP_EXPERIMENTAL)
            .compile();
        let insns = prog.instructions();
        let reject = insns.len() - 1;
        assert_eq!(insns[reject], BpfInsn::new(BPF_RET_K, 0, 0, 0));
        for (pc, insn) in insns.iter().enumerate() {
            if insn.code == BPF_JEQ_K && insn.jf != 0 {
                assert_eq!(pc + 1 + insn.jf as usize, reject);
            }
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        let prog = FilterSpec::new().ethertype(ETH_P_AVTP_EXPERIMENTAL).compile();
        assert_eq!(prog.run(&[0u8; 10]), 0);
    }

    #[test]
    fn test_multicast_group() {
        assert_eq!(FilterSpec::new().dest(GROUP).multicast_group(), Some(GROUP));
        assert_eq!(FilterSpec::new().dest(CAMERA).multicast_group(), None);
        assert_eq!(FilterSpec::new().multicast_group(), None);
    }
}
