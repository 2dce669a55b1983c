pub mod connection_state;
pub mod dedup;
pub mod handler;
pub mod peer_discovery;
pub mod server;
pub mod tls;
pub mod wire;
