//! Ethernet header handling.

use super::MacAddr;

/// Untagged Ethernet header length.
pub const ETH_HLEN: usize = 14;
/// 802.1Q tag length.
pub const VLAN_HLEN: usize = 4;
/// 802.1Q tag protocol identifier.
pub const ETH_P_8021Q: u16 = 0x8100;
/// Experimental AVB transport ethertype used by the cameras.
pub const ETH_P_AVTP_EXPERIMENTAL: u16 = 0x88B5;
/// IEEE 1722 registered ethertype.
pub const ETH_P_TSN: u16 = 0x22F0;

/// Result of decoding the link header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtherHeader {
    pub dest: MacAddr,
    pub source: MacAddr,
    /// Ethertype of the payload (inner type for tagged frames).
    pub ethertype: u16,
    /// VLAN identifier for 802.1Q frames.
    pub vlan: Option<u16>,
    /// Offset of the payload from the start of the frame.
    pub payload_offset: usize,
}

/// Decode the Ethernet header, looking through a single 802.1Q tag.
///
/// Returns `None` for frames too short to hold the header.
pub fn translate(frame: &[u8]) -> Option<EtherHeader> {
    if frame.len() < ETH_HLEN {
        return None;
    }
    let dest = mac_at(frame, 0);
    let source = mac_at(frame, 6);
    let outer = u16::from_be_bytes([frame[12], frame[13]]);

    if outer == ETH_P_8021Q {
        if frame.len() < ETH_HLEN + VLAN_HLEN {
            return None;
        }
        let tci = u16::from_be_bytes([frame[14], frame[15]]);
        Some(EtherHeader {
            dest,
            source,
            ethertype: u16::from_be_bytes([frame[16], frame[17]]),
            vlan: Some(tci & 0x0FFF),
            payload_offset: ETH_HLEN + VLAN_HLEN,
        })
    } else {
        Some(EtherHeader {
            dest,
            source,
            ethertype: outer,
            vlan: None,
            payload_offset: ETH_HLEN,
        })
    }
}

/// Write a link header into `buf`, returning its length.
///
/// `buf` must hold at least 18 bytes when `vlan` is set, 14 otherwise.
pub fn write_header(
    buf: &mut [u8],
    dest: MacAddr,
    source: MacAddr,
    vlan: Option<u16>,
    ethertype: u16,
) -> usize {
    buf[0..6].copy_from_slice(&dest.octets());
    buf[6..12].copy_from_slice(&source.octets());
    match vlan {
        Some(vid) => {
            buf[12..14].copy_from_slice(&ETH_P_8021Q.to_be_bytes());
            buf[14..16].copy_from_slice(&(vid & 0x0FFF).to_be_bytes());
            buf[16..18].copy_from_slice(&ethertype.to_be_bytes());
            ETH_HLEN + VLAN_HLEN
        }
        None => {
            buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
            ETH_HLEN
        }
    }
}

/// Build a complete frame from a header description and payload.
///
/// # Arguments
///
/// * `dest` - destination address
/// * `source` - source address
/// * `vlan` - 802.1Q VLAN identifier, `None` for an untagged frame
/// * `ethertype` - payload ethertype (inner type when tagged)
/// * `payload` - bytes following the link header
pub fn build_frame(
    dest: MacAddr,
    source: MacAddr,
    vlan: Option<u16>,
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HLEN + VLAN_HLEN + payload.len()];
    let header = write_header(&mut frame, dest, source, vlan, ethertype);
    frame[header..header + payload.len()].copy_from_slice(payload);
    frame.truncate(header + payload.len());
    frame
}

fn mac_at(frame: &[u8], offset: usize) -> MacAddr {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&frame[offset..offset + 6]);
    MacAddr::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST: MacAddr = MacAddr::new([0x91, 0xE0, 0xF0, 0, 0, 1]);
    const SRC: MacAddr = MacAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn test_untagged() {
        let frame = build_frame(DEST, SRC, None, ETH_P_AVTP_EXPERIMENTAL, &[1, 2, 3]);
        let header = translate(&frame).unwrap();
        assert_eq!(header.ethertype, 0x88B5);
        assert_eq!(header.payload_offset, 14);
        assert_eq!(header.vlan, None);
        assert_eq!(header.dest, DEST);
        assert_eq!(header.source, SRC);
        assert_eq!(&frame[header.payload_offset..], &[1, 2, 3]);
    }

    #[test]
    fn test_tagged() {
        let frame = build_frame(DEST, SRC, Some(0x56), ETH_P_AVTP_EXPERIMENTAL, &[9; 4]);
        assert_eq!(frame.len(), 22);
        let header = translate(&frame).unwrap();
        assert_eq!(header.ethertype, 0x88B5);
        assert_eq!(header.payload_offset, 18);
        assert_eq!(header.vlan, Some(0x56));
    }

    #[test]
    fn test_runt() {
        assert!(translate(&[0u8; 13]).is_none());
        let mut frame = [0u8; 16];
        frame[12] = 0x81;
        assert!(translate(&frame).is_none());
    }
}
