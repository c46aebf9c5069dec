use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ControllerConfig, GatewayCredentials};
use crate::error::ControllerError;
use crate::topic_map::{FunctionStatus, TopicMap, build_topic_map};

/// Turns a `(topic, payload)` pair into function calls.
///
/// Implementations own retries, timeouts and queueing of the calls.
pub trait Invoker: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        topic: &'a str,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), ControllerError>> + Send + 'a>>;
}

/// Gateway-backed invoker with a periodically rebuilt topic map.
pub struct Controller {
    config: ControllerConfig,
    credentials: Option<GatewayCredentials>,
    http: reqwest::Client,
    topic_map: Arc<TopicMap>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Controller {
    pub fn new(
        credentials: Option<GatewayCredentials>,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| ControllerError::Client(e.to_string()))?;
        Ok(Self {
            config,
            credentials,
            http,
            topic_map: Arc::new(TopicMap::new()),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn topic_map(&self) -> &Arc<TopicMap> {
        &self.topic_map
    }

    fn gateway(&self) -> &str {
        self.config.gateway_url.trim_end_matches('/')
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => req.basic_auth(&c.user, Some(&c.password)),
            None => req,
        }
    }

    /// Fetch the function list and swap in a fresh topic map.
    /// Returns the number of routed topics.
    pub async fn refresh_map(&self) -> Result<usize, ControllerError> {
        let url = format!("{}/system/functions", self.gateway());
        let list_err = |detail: String| ControllerError::ListFunctions { url: url.clone(), detail };

        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| list_err(e.to_string()))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| list_err(e.to_string()))?;
        if !status.is_success() {
            return Err(list_err(format!("{status}: {}", String::from_utf8_lossy(&body))));
        }

        let functions: Vec<FunctionStatus> =
            serde_json::from_slice(&body).map_err(|e| list_err(e.to_string()))?;
        let map = build_topic_map(&functions, &self.config.topic_annotation_delimiter);
        let topics = map.len();
        self.topic_map.sync(map);
        Ok(topics)
    }

    /// Rebuild the topic map now and then every `rebuild_interval` until cancelled.
    pub fn begin_map_builder(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.rebuild_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match controller.refresh_map().await {
                            Ok(topics) => tracing::debug!(topics, "topic map rebuilt"),
                            Err(e) => tracing::warn!(error = %e, "topic map rebuild failed"),
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("map builder stopped");
        })
    }

    async fn invoke_function(
        &self,
        function: &str,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), String> {
        let url = format!("{}/function/{function}", self.gateway());
        let resp = self
            .authorize(self.http.post(&url))
            .header("X-Topic", topic)
            .body(payload)
            .send()
            .await
            .map_err(|e| format!("{function}: {e}"))?;

        let status = resp.status();
        if self.config.print_response {
            tracing::info!(%function, %topic, status = status.as_u16(), "function response");
        }
        if self.config.print_response_body {
            match resp.text().await {
                Ok(body) => tracing::info!(%function, %topic, %body, "function response body"),
                Err(e) => tracing::warn!(%function, error = %e, "read response body"),
            }
        }

        if status.is_success() {
            Ok(())
        } else {
            Err(format!("{function}: {status}"))
        }
    }
}

impl Invoker for Controller {
    fn invoke<'a>(
        &'a self,
        topic: &'a str,
        payload: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), ControllerError>> + Send + 'a>> {
        Box::pin(async move {
            let functions = self.topic_map.match_topic(topic);
            if functions.is_empty() {
                tracing::debug!(%topic, "no functions subscribed to topic");
                return Ok(());
            }

            let mut failures = Vec::new();
            for function in &functions {
                if let Err(e) = self.invoke_function(function, topic, payload.clone()).await {
                    tracing::warn!(%topic, error = %e, "invocation failed");
                    failures.push(e);
                }
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(ControllerError::Invocation { topic: topic.to_string(), failures })
            }
        })
    }
}
