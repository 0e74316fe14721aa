//! Connection dispatch bridge
//!
//! Turns inbound packets into immediate replies or scheduled events, and
//! routes the payloads of fired events back to the connection they came from.

mod bridge;
mod connection;
mod packet;
mod registry;

pub use bridge::{BridgeError, BridgeObserver, BridgeStats, DispatchBridge, DispatchOutcome};
pub use connection::{ChannelConnection, Connection, ConnectionError};
pub use packet::{DecodeError, ImmediateAction, PacketDecoder, PacketIntent};
pub use registry::ConnectionRegistry;
