use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::DEFAULT_MAX_FRAME;
use crate::error::NsqError;

/// Client settings shared by consumers and producers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total RDY budget of a consumer, split across its connections.
    pub max_in_flight: u64,
    /// Number of handler tasks per consumer.
    pub concurrency: usize,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub lookupd_poll_interval: Duration,
    /// Delay between re-dial attempts of a lost direct connection.
    pub reconnect_interval: Duration,
    /// How long a stopping connection waits for in-flight messages.
    pub drain_timeout: Duration,
    pub max_frame_size: usize,
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
        let client_id = hostname.split('.').next().unwrap_or("localhost").to_string();
        Self {
            max_in_flight: 1,
            concurrency: 1,
            dial_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            lookupd_poll_interval: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME,
            client_id,
            hostname,
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Serialize)]
struct IdentifyBody<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: u64,
}

impl Config {
    pub(crate) fn identify_body(&self) -> Result<Bytes, NsqError> {
        let body = IdentifyBody {
            client_id: &self.client_id,
            hostname: &self.hostname,
            user_agent: &self.user_agent,
            feature_negotiation: false,
            heartbeat_interval: u64::try_from(self.heartbeat_interval.as_millis())
                .unwrap_or(u64::MAX),
        };
        Ok(Bytes::from(serde_json::to_vec(&body)?))
    }
}

/// Topic and channel names: `[.a-zA-Z0-9_-]`, 1..=64 chars, optional `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<(), NsqError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(NsqError::InvalidName { kind, name: name.to_string() })
    }
}
