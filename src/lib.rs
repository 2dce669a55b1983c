//! Gossip relay network client.
//!
//! A [`Client`] keeps one TLS connection per peer, floods every newly seen
//! [`Packet`] to all of its other peers and hands each distinct packet to the
//! application exactly once.

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod packet;

pub use client::{Client, Delivery, FrameOutcome, PeerInfo};
pub use error::{AppError, RelayError};
pub use packet::{Packet, PacketHash, PacketId};
