pub mod messages;
pub mod transport;

pub use messages::{AudioWireConfig, Inbound, InteractionEvent, Outbound, OutboundMessage};
pub use transport::{connect, Transport, TransportItem};
