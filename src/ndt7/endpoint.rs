//! Builds the WebSocket URL for a subtest from [`Settings`].

use super::Subtest;
use crate::errors::TestError;
use crate::settings::Settings;
use std::net::Ipv6Addr;
use url::Url;

/// Build the URL of `subtest` on the configured server.
///
/// Query parameters are emitted in sorted key order (`adaptive`, then
/// `duration`), and only when configured.
pub fn build_url(settings: &Settings, subtest: Subtest) -> Result<Url, TestError> {
    let scheme = if settings.use_tls() { "wss" } else { "ws" };
    let host = host_component(&settings.hostname)?;

    let authority = match settings.port() {
        Some(port) => {
            port.parse::<u16>().map_err(|_| {
                TestError::invalid_hostname(format!("invalid port {:?}", port))
            })?;
            format!("{}:{}", host, port)
        }
        None => host,
    };

    let mut url = Url::parse(&format!("{}://{}{}", scheme, authority, subtest.path()))
        .map_err(|e| {
            TestError::invalid_hostname(format!(
                "cannot build URL for {:?}: {}",
                settings.hostname, e
            ))
            .with_source(e)
        })?;

    let duration = settings.requested_duration();
    if settings.adaptive || duration.is_some() {
        let mut query = url.query_pairs_mut();
        if settings.adaptive {
            query.append_pair("adaptive", "true");
        }
        if let Some(duration) = duration {
            query.append_pair("duration", &duration.to_string());
        }
    }

    Ok(url)
}

/// The host as it appears in a URL authority: IPv6 literals are bracketed.
fn host_component(hostname: &str) -> Result<String, TestError> {
    if hostname.is_empty() {
        return Err(TestError::invalid_hostname("hostname is empty"));
    }

    if hostname.parse::<Ipv6Addr>().is_ok() {
        return Ok(format!("[{}]", hostname));
    }

    let forbidden = |c: char| {
        c.is_whitespace() || matches!(c, ':' | '/' | '?' | '#' | '@' | '[' | ']' | '\\')
    };
    if hostname.contains(forbidden) {
        return Err(TestError::invalid_hostname(format!(
            "{:?} is neither a hostname nor an IP address",
            hostname
        )));
    }

    Ok(hostname.to_string())
}
