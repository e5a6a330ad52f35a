//! Wire protocol and transport seam

pub mod protocol;
pub mod transport;

pub use protocol::{EntityId, EntityKind, InboundMsg, OutboundMsg, PeerId, RawRecord};
pub use transport::{LoopbackHub, LoopbackTransport, Transport, TransportError};
