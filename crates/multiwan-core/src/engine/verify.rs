//! Source address verification
//!
//! Asks an IP echo service which address a bound request arrived from.
//! A mismatch means the OS routed the traffic through another uplink.

use crate::engine::session::{create_bound_session, parse_source_ip};
use crate::error::EngineError;
use multiwan_types::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct OriginReply {
    origin: String,
}

/// What the echo service saw for one source address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceIpCheck {
    pub source_ip: String,
    /// First address of the reported origin, empty when the reply had none
    pub observed: String,
    pub matches: bool,
}

/// Check that requests bound to `source_ip` leave with that address
pub async fn verify_source_ip(
    source_ip: &str,
    config: &EngineConfig,
) -> Result<SourceIpCheck, EngineError> {
    let local = parse_source_ip(source_ip)?;
    let client = create_bound_session(source_ip, config)?;

    let response = client
        .get(&config.ip_check_url)
        .timeout(VERIFY_TIMEOUT)
        .send()
        .await
        .map_err(|e| EngineError::network(e, 0))?;

    let status = response.status();
    if !status.is_success() {
        warn!("IP check via {} returned {}", source_ip, status);
        return Err(EngineError::Network {
            message: format!("HTTP status {} for {}", status, config.ip_check_url),
            downloaded: 0,
        });
    }

    let reply: OriginReply = response
        .json()
        .await
        .map_err(|e| EngineError::network(e, 0))?;

    let observed = first_origin(&reply.origin).to_string();
    let matches = observed.parse::<IpAddr>().is_ok_and(|ip| ip == local);
    if matches {
        info!("Source {} verified", source_ip);
    } else {
        warn!("Source {} leaves as {:?}", source_ip, observed);
    }

    Ok(SourceIpCheck {
        source_ip: source_ip.to_string(),
        observed,
        matches,
    })
}

/// Proxies append hops, so only the first entry is the client
fn first_origin(origin: &str) -> &str {
    origin.split(',').next().unwrap_or("").trim()
}
