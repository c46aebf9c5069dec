use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::config::{BrokerAddressSet, ConnectorConfig};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks startup until the broker set accepts TCP connections.
///
/// Lookup mode needs any one nsqlookupd; direct mode needs every nsqd.
/// There is no overall deadline: a broker that never comes up keeps the
/// gate closed.
#[derive(Debug, Clone)]
pub struct BrokerReadinessGate {
    brokers: BrokerAddressSet,
    probe_timeout: Duration,
    retry_interval: Duration,
}

impl BrokerReadinessGate {
    pub fn new(brokers: BrokerAddressSet, probe_timeout: Duration) -> Self {
        Self { brokers, probe_timeout, retry_interval: DEFAULT_RETRY_INTERVAL }
    }

    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self::new(config.brokers.clone(), config.dial_timeout)
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Wait until a probe pass succeeds. Returns the number of passes made.
    pub async fn wait(&self) -> u32 {
        let mut passes = 0u32;
        loop {
            passes = passes.saturating_add(1);
            if self.probe_pass().await {
                tracing::info!(
                    mode = self.brokers.mode(),
                    brokers = ?self.brokers.addresses(),
                    passes,
                    "brokers reachable"
                );
                return passes;
            }
            tracing::info!(
                mode = self.brokers.mode(),
                retry_in = ?self.retry_interval,
                "waiting for brokers"
            );
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// One round of concurrent probes.
    pub async fn probe_pass(&self) -> bool {
        let addrs = self.brokers.probe_addresses();
        if addrs.is_empty() {
            return false;
        }

        let mut probes = JoinSet::new();
        for addr in addrs {
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                let ok = probe(&addr, timeout).await;
                (addr, ok)
            });
        }

        match self.brokers {
            BrokerAddressSet::Lookup(_) => {
                while let Some(joined) = probes.join_next().await {
                    if let Ok((_, true)) = joined {
                        probes.abort_all();
                        return true;
                    }
                }
                false
            }
            BrokerAddressSet::Direct(_) => {
                let mut all = true;
                while let Some(joined) = probes.join_next().await {
                    match joined {
                        Ok((_, true)) => {}
                        Ok((addr, false)) => {
                            tracing::debug!(nsqd = %addr, "nsqd not reachable yet");
                            all = false;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "probe task failed");
                            all = false;
                        }
                    }
                }
                all
            }
        }
    }
}

/// Connect and immediately drop the stream.
async fn probe(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::debug!(%addr, error = %e, "probe refused");
            false
        }
        Err(_) => {
            tracing::debug!(%addr, ?timeout, "probe timed out");
            false
        }
    }
}
