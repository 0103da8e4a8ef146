use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::utils::parse_headers_with_escapes;

/// Agent string the trading service expects from benchmark clients.
pub const DEFAULT_USER_AGENT: &str = "Isutrader/0.0.1";

/// Configuration for building the per-user HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for a single physical attempt.
    pub attempt_timeout: Duration,
    pub user_agent: String,
    /// DNS override in the form `hostname:ip:port`.
    pub resolve_target_addr: Option<String>,
    /// `Name:Value` pairs separated by commas, `\,` escapes a comma.
    pub custom_headers: Option<String>,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            resolve_target_addr: None,
            custom_headers: None,
            pool_max_idle_per_host: 8,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Builds a reqwest client for one simulated user.
///
/// Every client gets its own cookie jar, never follows redirects and applies
/// `attempt_timeout` to each request it sends.
pub fn build_client(
    config: &ClientConfig,
) -> Result<reqwest::Client, Box<dyn std::error::Error + Send + Sync>> {
    let mut client_builder = reqwest::Client::builder()
        .cookie_store(true)
        .redirect(redirect::Policy::none())
        .timeout(config.attempt_timeout)
        .user_agent(config.user_agent.as_str())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout);

    if let Some(resolve_str) = config.resolve_target_addr.as_deref() {
        if !resolve_str.is_empty() {
            let (hostname, addr) = parse_dns_override(resolve_str)?;
            debug!(hostname = %hostname, addr = %addr, "Applying DNS override");
            client_builder = client_builder.resolve(&hostname, addr);
        }
    }

    let parsed_headers = parse_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers);
    }

    Ok(client_builder.build()?)
}

/// Parses `hostname:ip:port` into the pair reqwest's resolver override wants.
pub fn parse_dns_override(
    resolve_str: &str,
) -> Result<(String, SocketAddr), Box<dyn std::error::Error + Send + Sync>> {
    let parts: Vec<&str> = resolve_str.split(':').map(str::trim).collect();
    let [hostname, ip, port] = parts.as_slice() else {
        return Err(format!(
            "RESOLVE_TARGET_ADDR ('{}') is not in the expected format 'hostname:ip:port'",
            resolve_str
        )
        .into());
    };

    if hostname.is_empty() || ip.is_empty() || port.is_empty() {
        return Err(format!(
            "RESOLVE_TARGET_ADDR ('{}') has an empty part. Format: 'hostname:ip:port'",
            resolve_str
        )
        .into());
    }

    let port: u16 = port.parse().map_err(|e| {
        format!(
            "Failed to parse port '{}' in RESOLVE_TARGET_ADDR: {}",
            port, e
        )
    })?;
    let addr = format!("{}:{}", ip, port);
    let socket_addr: SocketAddr = addr.parse().map_err(|e| {
        format!(
            "Failed to parse '{}' as a socket address for RESOLVE_TARGET_ADDR: {}",
            addr, e
        )
    })?;

    Ok((hostname.to_string(), socket_addr))
}

/// Parses the `CUSTOM_HEADERS` format into a header map.
pub fn parse_custom_headers(
    custom_headers_str: Option<&str>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair in parse_headers_with_escapes(headers_str) {
        let header_pair = header_pair.trim();

        let Some((name_str, value_str)) = header_pair.split_once(':') else {
            return Err(format!(
                "Invalid header format in CUSTOM_HEADERS: '{}'. Expected 'Name:Value'.",
                header_pair
            )
            .into());
        };
        let name_str = name_str.trim();
        if name_str.is_empty() {
            return Err(format!(
                "Invalid header format: Header name cannot be empty in '{}'.",
                header_pair
            )
            .into());
        }

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name: {}. Name: '{}'", e, name_str))?;
        let header_value = HeaderValue::from_str(value_str.trim()).map_err(|e| {
            format!(
                "Invalid header value for '{}': {}. Value: '{}'",
                name_str, e, value_str
            )
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    info!(count = parsed_headers.len(), "Configured custom default headers");
    Ok(parsed_headers)
}
