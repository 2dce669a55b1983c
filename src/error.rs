use thiserror::Error;

use crate::network::tls::TlsError;

/// Errors raised by the relay library
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid packet size: {size} bytes (max: {max})")]
    InvalidPacketSize { size: usize, max: usize },

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Failed to connect to {peer}: {reason}")]
    Connect { peer: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Host list error: {0}")]
    HostList(String),

    #[error("No server certificate configured, cannot accept inbound peers")]
    NoServerIdentity,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the `dcnd` daemon
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
