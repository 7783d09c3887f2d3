//! Network side: link headers, socket filters and packet rings.

pub mod ether;
pub mod filter;
pub mod iface;
pub mod mac;
pub mod ring;
pub mod stream_filter;

pub use filter::{BpfProgram, FilterSpec};
pub use iface::NetInterface;
pub use mac::MacAddr;
pub use ring::{PacketRing, RawFrame, RingGeometry, RingStats, TxFrame};
pub use stream_filter::{Reactor, ReactorHandle, StreamFilter, StreamHandler};
