//! Source-bound HTTP sessions
//!
//! Every client built here binds its outgoing sockets to a fixed local IP,
//! letting the OS pick the port. That is what routes a transfer through a
//! particular WAN interface.

use crate::error::EngineError;
use multiwan_types::EngineConfig;
use reqwest::{redirect, Client};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("multiwan/", env!("CARGO_PKG_VERSION"));

/// Parse a source IP string into an address usable for socket binding
pub fn parse_source_ip(source_ip: &str) -> Result<IpAddr, EngineError> {
    source_ip
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidSourceIp(source_ip.to_string()))
}

/// Create a `reqwest::Client` whose connections originate from `source_ip`
///
/// Binding failures (address not assigned to any interface, interface down)
/// are not detected here; they surface as connect errors on first use.
pub fn create_bound_session(source_ip: &str, config: &EngineConfig) -> Result<Client, EngineError> {
    let local = parse_source_ip(source_ip)?;
    debug!("Building client bound to {}", local);

    Client::builder()
        .local_address(local)
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .redirect(redirect::Policy::limited(10))
        .danger_accept_invalid_certs(!config.verify_tls)
        .build()
        .map_err(|e| EngineError::Unexpected(format!("failed to build HTTP client: {}", e)))
}
