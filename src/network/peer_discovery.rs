//! Host-list discovery.
//!
//! Fetches a JSON array of peer addresses from a configured URL:
//!
//! ```json
//! ["relay1.example.org:7400", "10.0.0.7", "[2001:db8::1]:7400"]
//! ```
//!
//! Entries without a port get the configured default port.

use std::time::Duration;

use crate::error::RelayError;

/// Request timeout for one poll
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HostList {
    url: String,
    default_port: u16,
    http: reqwest::Client,
}

impl HostList {
    pub fn new(url: String, default_port: u16) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| RelayError::HostList(e.to_string()))?;

        Ok(Self {
            url,
            default_port,
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and normalize the current peer list
    pub async fn fetch(&self) -> Result<Vec<String>, RelayError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::HostList(e.to_string()))?;

        let peer_list: Vec<String> = response
            .json()
            .await
            .map_err(|e| RelayError::HostList(e.to_string()))?;

        Ok(parse_peer_list(peer_list, self.default_port))
    }
}

/// Normalize addresses to `host:port`, dropping blanks
pub fn parse_peer_list(peers: Vec<String>, default_port: u16) -> Vec<String> {
    peers
        .into_iter()
        .filter_map(|peer| {
            let peer = peer.trim();
            if peer.is_empty() {
                return None;
            }

            if has_port(peer) {
                return Some(peer.to_string());
            }

            // Bare IPv6 literal
            if peer.matches(':').count() > 1 && !peer.starts_with('[') {
                return Some(format!("[{}]:{}", peer, default_port));
            }

            Some(format!("{}:{}", peer, default_port))
        })
        .collect()
}

fn has_port(peer: &str) -> bool {
    if peer.starts_with('[') {
        // [v6]:port
        return peer
            .rsplit_once("]:")
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    }

    // A single colon separates host and port; more means a bare IPv6 literal
    peer.matches(':').count() == 1
        && peer
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}
