//! PeerWire - Framed peer-to-peer connections
//!
//! A small connection layer for two-player sessions: a binary frame codec with
//! magic-number guards, a typed game-message envelope, connections with
//! independent read and write pumps, a three-step handshake and a pool owning
//! the shared reactor.

pub mod config;
pub mod network;
pub mod protocol;
