//! TCP transport client for the platform protocol.
//!
//! Owns the socket, performs the logon handshake, exchanges heartbeats,
//! and surfaces every received frame plus a terminal disconnect event on
//! an event channel. Framing is a pluggable [`codec::WireCodec`]; nothing
//! above this crate knows how frames are delimited on the wire.

pub mod codec;
pub mod connection;
pub mod error;
pub mod heartbeat;

pub use codec::{LengthPrefixedJson, WireCodec};
pub use connection::{
    connect, Credentials, DisconnectReason, TransportConfig, TransportEvent, TransportHandle,
};
pub use error::{TransportError, TransportResult};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats};
