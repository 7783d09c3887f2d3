//! AVTP PDU parsing.

use thiserror::Error;

/// Fixed header length; the payload starts right after it.
pub const AVTP_HEADER_LEN: usize = 24;
/// Subtype carried by the camera JPEG streams.
pub const CAMERA_STREAM_SUBTYPE: u8 = 0x02;

/// Reasons a PDU is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("PDU of {0} bytes is shorter than the AVTP header")]
    Truncated(usize),

    #[error("unexpected subtype {0:#04x}")]
    Subtype(u8),

    #[error("stream data length {declared} exceeds available payload {available}")]
    Length { declared: usize, available: usize },
}

/// A validated view of one AVTP PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvtpPdu<'a> {
    pub subtype: u8,
    pub sequence: u8,
    /// Source timestamp (not used for ordering).
    pub timestamp: u32,
    pub protocol_header: u16,
    /// Stream data, trimmed to the declared length.
    pub payload: &'a [u8],
}

impl<'a> AvtpPdu<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < AVTP_HEADER_LEN {
            return Err(ProtocolError::Truncated(bytes.len()));
        }
        let subtype = bytes[0] & 0x7F;
        if subtype != CAMERA_STREAM_SUBTYPE {
            return Err(ProtocolError::Subtype(subtype));
        }
        let declared = u16::from_be_bytes([bytes[20], bytes[21]]) as usize;
        let available = bytes.len() - AVTP_HEADER_LEN;
        if declared > available {
            return Err(ProtocolError::Length {
                declared,
                available,
            });
        }

        Ok(Self {
            subtype,
            sequence: bytes[2],
            timestamp: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            protocol_header: u16::from_be_bytes([bytes[22], bytes[23]]),
            payload: &bytes[AVTP_HEADER_LEN..AVTP_HEADER_LEN + declared],
        })
    }
}

/// Build a camera-stream PDU carrying `payload`.
#[cfg(test)]
pub(crate) fn build_pdu(sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut pdu = vec![0u8; AVTP_HEADER_LEN];
    pdu[0] = 0x80 | CAMERA_STREAM_SUBTYPE;
    pdu[2] = sequence;
    pdu[20..22].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let mut bytes = build_pdu(7, &[0xFF, 0xD8, 1, 2]);
        bytes[12..16].copy_from_slice(&0x0102_0304u32.to_be_bytes());
        bytes[22..24].copy_from_slice(&0xABCDu16.to_be_bytes());
        // trailing padding beyond the declared length
        bytes.extend_from_slice(&[0; 6]);

        let pdu = AvtpPdu::parse(&bytes).unwrap();
        assert_eq!(pdu.subtype, 0x02);
        assert_eq!(pdu.sequence, 7);
        assert_eq!(pdu.timestamp, 0x0102_0304);
        assert_eq!(pdu.protocol_header, 0xABCD);
        assert_eq!(pdu.payload, &[0xFF, 0xD8, 1, 2]);
    }

    #[test]
    fn test_reject() {
        assert_eq!(AvtpPdu::parse(&[0; 10]), Err(ProtocolError::Truncated(10)));

        let mut bytes = build_pdu(0, &[1, 2, 3]);
        bytes[0] = 0x03;
        assert_eq!(AvtpPdu::parse(&bytes), Err(ProtocolError::Subtype(0x03)));

        let mut bytes = build_pdu(0, &[1, 2, 3]);
        bytes[21] = 10;
        assert_eq!(
            AvtpPdu::parse(&bytes),
            Err(ProtocolError::Length {
                declared: 10,
                available: 3
            })
        );
    }
}
