use std::time::Duration;

use faas_controller::ControllerConfig;
use nsq_client::parse_duration;

use crate::error::ConnectorError;

pub const DEFAULT_CHANNEL: &str = "faas-nsq-queue-workers";
pub const DEFAULT_NSQLOOKUPD: &str = "nsqlookupd";
pub const DEFAULT_NSQD: &str = "nsqd:4150";
pub const DEFAULT_MAX_IN_FLIGHT: u64 = 1000;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(6);

const LOOKUPD_PORT: u16 = 4161;
const NSQD_PORT: u16 = 4150;

// ═══════════════════════════════════════════════════════════════
//  BrokerAddressSet
// ═══════════════════════════════════════════════════════════════

/// Where consumers find their brokers. Chosen once, at config resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAddressSet {
    /// nsqlookupd HTTP addresses; ready when any of them answers.
    Lookup(Vec<String>),
    /// nsqd TCP addresses; ready when all of them answer.
    Direct(Vec<String>),
}

impl BrokerAddressSet {
    pub fn addresses(&self) -> &[String] {
        match self {
            BrokerAddressSet::Lookup(a) | BrokerAddressSet::Direct(a) => a,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            BrokerAddressSet::Lookup(_) => "nsqlookupd",
            BrokerAddressSet::Direct(_) => "nsqd",
        }
    }

    /// `host:port` pairs for a bare TCP probe (scheme and path stripped).
    pub fn probe_addresses(&self) -> Vec<String> {
        self.addresses().iter().map(|a| strip_scheme(a)).collect()
    }
}

fn strip_scheme(addr: &str) -> String {
    let rest = addr
        .strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr);
    rest.split('/').next().unwrap_or(rest).to_string()
}

// ═══════════════════════════════════════════════════════════════
//  ConnectorConfig
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub controller: ControllerConfig,
    /// Distinct topics in configuration order. Never empty.
    pub topics: Vec<String>,
    pub brokers: BrokerAddressSet,
    /// Consumer-group identity shared by every consumer.
    pub channel: String,
    pub max_in_flight: u64,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
}

impl ConnectorConfig {
    pub fn from_env() -> Result<Self, ConnectorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from any key lookup. Only a missing topic list is fatal;
    /// unparsable numbers and durations keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConnectorError> {
        let topics = dedup(parse_list(lookup("topics").as_deref().unwrap_or("")));
        if topics.is_empty() {
            return Err(ConnectorError::NoTopics);
        }

        let lookupds: Vec<String> = parse_list(lookup("nsqlookupd").as_deref().unwrap_or(DEFAULT_NSQLOOKUPD))
            .into_iter()
            .map(|a| with_default_port(&a, LOOKUPD_PORT))
            .collect();
        let brokers = if lookupds.is_empty() {
            let nsqds: Vec<String> = parse_list(lookup("nsqd").as_deref().unwrap_or(DEFAULT_NSQD))
                .into_iter()
                .map(|a| with_default_port(&a, NSQD_PORT))
                .collect();
            if nsqds.is_empty() {
                return Err(ConnectorError::Config {
                    context: "nsqd",
                    detail: "neither nsqlookupd nor nsqd addresses configured".into(),
                });
            }
            BrokerAddressSet::Direct(nsqds)
        } else {
            BrokerAddressSet::Lookup(lookupds)
        };

        let defaults = ControllerConfig::default();
        let controller = ControllerConfig {
            gateway_url: lookup("gateway_url")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.gateway_url),
            upstream_timeout: duration_or(&lookup, "upstream_timeout", defaults.upstream_timeout),
            rebuild_interval: duration_or(&lookup, "rebuild_interval", defaults.rebuild_interval),
            print_response: flag(&lookup, "print_response"),
            print_response_body: flag(&lookup, "print_response_body"),
            topic_annotation_delimiter: lookup("topic_delimiter")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.topic_annotation_delimiter),
        };

        let max_in_flight = match lookup("nsq_maxinflight") {
            None => DEFAULT_MAX_IN_FLIGHT,
            Some(v) => match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(key = "nsq_maxinflight", value = %v, "invalid value, using default");
                    DEFAULT_MAX_IN_FLIGHT
                }
            },
        };

        Ok(Self {
            controller,
            topics,
            brokers,
            channel: lookup("nsq_channel")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CHANNEL.into()),
            max_in_flight,
            dial_timeout: duration_or(&lookup, "nsq_dial_timeout", DEFAULT_DIAL_TIMEOUT),
            write_timeout: duration_or(&lookup, "nsq_write_timeout", DEFAULT_WRITE_TIMEOUT),
        })
    }

    /// Client settings for every consumer of the group.
    pub fn nsq_config(&self) -> nsq_client::Config {
        nsq_client::Config {
            max_in_flight: self.max_in_flight,
            dial_timeout: self.dial_timeout,
            write_timeout: self.write_timeout,
            ..nsq_client::Config::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Parsing helpers
// ═══════════════════════════════════════════════════════════════

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn with_default_port(addr: &str, port: u16) -> String {
    let has_port = addr
        .rsplit_once(':')
        .is_some_and(|(_, p)| p.trim_end_matches('/').parse::<u16>().is_ok());
    if has_port {
        addr.to_string()
    } else {
        format!("{addr}:{port}")
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    match lookup(key).as_deref() {
        None | Some("") | Some("0") | Some("false") => false,
        Some("1") | Some("true") => true,
        Some(other) => {
            tracing::warn!(%key, value = %other, "invalid flag, using default");
            false
        }
    }
}

fn duration_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key) {
        None => default,
        Some(v) => parse_duration(&v).unwrap_or_else(|| {
            tracing::warn!(%key, value = %v, "invalid duration, using default");
            default
        }),
    }
}
