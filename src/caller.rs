use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const UNKNOWN: &str = "unknown";

/// Who is redeeming: client address and user agent, recorded on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub ip: String,
    pub user_agent: String,
}

impl CallerContext {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Builds the context from inbound request headers.
    ///
    /// The client address is the first hop of `X-Forwarded-For`, then
    /// `X-Real-IP`, then the direct peer address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        let ip = forwarded
            .or(real_ip)
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN.to_string());

        let user_agent = headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string();

        Self { ip, user_agent }
    }
}
