//! AVTP camera streams: PDU parsing and JPEG frame reassembly.

pub mod assembler;
pub mod pdu;
pub mod producer;

pub use assembler::{
    AssemblerState, AssemblerStats, DropReason, FrameAssembler, FrameBuffer, InputPool, PduOutcome,
};
pub use pdu::{AvtpPdu, ProtocolError, AVTP_HEADER_LEN, CAMERA_STREAM_SUBTYPE};
pub use producer::{CameraLink, CameraSet, PduSink};
