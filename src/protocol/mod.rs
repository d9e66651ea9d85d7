//! Protocol module - Defines the wire protocol for peer communication
//!
//! Every message travels inside a fixed binary envelope:
//! - 2 bytes header magic (`0xFE 0xEF`)
//! - 4 bytes total frame length (little-endian, envelope included)
//! - Variable length payload (2 byte message type + body)
//! - 2 bytes footer magic (`0xFA 0xAF`)

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Default port for peer connections
pub const DEFAULT_PORT: u16 = 466;

/// Default time allowed for an outgoing connect (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default time allowed for an incoming peer to show up (seconds)
pub const DEFAULT_ACCEPT_TIMEOUT_SECS: u64 = 50;

/// Magic bytes opening every frame
pub const HEADER_MAGIC: [u8; 2] = [0xFE, 0xEF];

/// Magic bytes closing every frame
pub const FOOTER_MAGIC: [u8; 2] = [0xFA, 0xAF];
