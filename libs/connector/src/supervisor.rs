use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use faas_controller::Invoker;
use nsq_client::{Consumer, NsqError};
use tokio::sync::watch;

use crate::config::{BrokerAddressSet, ConnectorConfig};
use crate::error::ConnectorError;
use crate::handler::TopicMessageHandler;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ═══════════════════════════════════════════════════════════════
//  Consumer seam
// ═══════════════════════════════════════════════════════════════

/// A subscription to one topic, as seen by the supervisor.
pub trait TopicConsumer: Send + Sync + 'static {
    fn topic(&self) -> &str;

    /// Attach to the broker set in the mode it was resolved to.
    fn connect<'a>(&'a self, brokers: &'a BrokerAddressSet) -> BoxFuture<'a, Result<(), NsqError>>;

    /// Begin stopping. Must be idempotent.
    fn stop(&self);

    /// Resolves once the stop sequence has completed.
    fn stopped(&self) -> BoxFuture<'_, ()>;
}

/// Builds one consumer per topic with its handler already attached.
pub trait ConsumerFactory: Send + Sync {
    type Consumer: TopicConsumer;

    fn create(
        &self,
        topic: &str,
        channel: &str,
        handler: TopicMessageHandler,
    ) -> Result<Self::Consumer, NsqError>;
}

impl TopicConsumer for Consumer {
    fn topic(&self) -> &str {
        Consumer::topic(self)
    }

    fn connect<'a>(&'a self, brokers: &'a BrokerAddressSet) -> BoxFuture<'a, Result<(), NsqError>> {
        Box::pin(async move {
            match brokers {
                BrokerAddressSet::Lookup(addrs) => self.connect_to_nsqlookupds(addrs).await,
                BrokerAddressSet::Direct(addrs) => self.connect_to_nsqds(addrs).await,
            }
        })
    }

    fn stop(&self) {
        Consumer::stop(self)
    }

    fn stopped(&self) -> BoxFuture<'_, ()> {
        Box::pin(Consumer::stopped(self))
    }
}

/// Factory of real NSQ consumers sharing one client configuration.
#[derive(Debug, Clone)]
pub struct NsqConsumerFactory {
    config: nsq_client::Config,
}

impl NsqConsumerFactory {
    pub fn new(config: nsq_client::Config) -> Self {
        Self { config }
    }
}

impl ConsumerFactory for NsqConsumerFactory {
    type Consumer = Consumer;

    fn create(
        &self,
        topic: &str,
        channel: &str,
        handler: TopicMessageHandler,
    ) -> Result<Consumer, NsqError> {
        let consumer = Consumer::new(topic, channel, self.config.clone())?;
        consumer.add_handler(handler)?;
        Ok(consumer)
    }
}

// ═══════════════════════════════════════════════════════════════
//  CompletionBarrier
// ═══════════════════════════════════════════════════════════════

/// Releases once `arrive` has been called `count` times.
#[derive(Debug, Clone)]
pub struct CompletionBarrier {
    remaining: Arc<watch::Sender<usize>>,
}

impl CompletionBarrier {
    pub fn new(count: usize) -> Self {
        let (tx, _) = watch::channel(count);
        Self { remaining: Arc::new(tx) }
    }

    pub fn arrive(&self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

// ═══════════════════════════════════════════════════════════════
//  ConsumerGroupSupervisor
// ═══════════════════════════════════════════════════════════════

/// Owns one consumer per topic, all in the same channel.
pub struct ConsumerGroupSupervisor<F: ConsumerFactory> {
    factory: F,
    invoker: Arc<dyn Invoker>,
    topics: Vec<String>,
    channel: String,
    brokers: BrokerAddressSet,
}

impl<F: ConsumerFactory> std::fmt::Debug for ConsumerGroupSupervisor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroupSupervisor")
            .field("topics", &self.topics)
            .field("channel", &self.channel)
            .field("brokers", &self.brokers)
            .finish()
    }
}

impl<F: ConsumerFactory> ConsumerGroupSupervisor<F> {
    pub fn new(factory: F, invoker: Arc<dyn Invoker>, config: &ConnectorConfig) -> Self {
        Self {
            factory,
            invoker,
            topics: config.topics.clone(),
            channel: config.channel.clone(),
            brokers: config.brokers.clone(),
        }
    }

    /// Create and connect every consumer. The first failure stops the ones
    /// already created and is returned.
    pub async fn start(&self) -> Result<RunningGroup<F::Consumer>, ConnectorError> {
        if self.topics.is_empty() {
            return Err(ConnectorError::NoTopics);
        }

        let mut consumers: Vec<Arc<F::Consumer>> = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            let handler = TopicMessageHandler::new(topic.clone(), self.invoker.clone());
            let consumer = match self.factory.create(topic, &self.channel, handler) {
                Ok(c) => Arc::new(c),
                Err(source) => {
                    stop_each(&consumers);
                    return Err(ConnectorError::CreateConsumer { topic: topic.clone(), source });
                }
            };
            consumers.push(consumer.clone());

            if let Err(source) = consumer.connect(&self.brokers).await {
                stop_each(&consumers);
                return Err(ConnectorError::ConnectConsumer { topic: topic.clone(), source });
            }
            tracing::info!(%topic, "binding to topic");
        }

        tracing::info!(
            topics = ?self.topics,
            channel = %self.channel,
            mode = self.brokers.mode(),
            "binding to topics"
        );

        let barrier = CompletionBarrier::new(consumers.len());
        for consumer in &consumers {
            let consumer = consumer.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                consumer.stopped().await;
                tracing::debug!(topic = %consumer.topic(), "consumer reported stopped");
                barrier.arrive();
            });
        }

        Ok(RunningGroup { consumers, barrier })
    }

    /// Start the group and supervise it until `shutdown` resolves and every
    /// consumer has stopped.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ConnectorError> {
        let group = self.start().await?;
        group.supervise(shutdown).await;
        Ok(())
    }
}

fn stop_each<C: TopicConsumer>(consumers: &[Arc<C>]) {
    for consumer in consumers {
        consumer.stop();
    }
}

/// Connected consumers plus the barrier their stop notifications feed.
pub struct RunningGroup<C: TopicConsumer> {
    consumers: Vec<Arc<C>>,
    barrier: CompletionBarrier,
}

impl<C: TopicConsumer> std::fmt::Debug for RunningGroup<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<&str> = self.consumers.iter().map(|c| c.topic()).collect();
        f.debug_struct("RunningGroup")
            .field("topics", &topics)
            .field("remaining", &self.barrier.remaining())
            .finish()
    }
}

impl<C: TopicConsumer> RunningGroup<C> {
    pub fn consumers(&self) -> &[Arc<C>] {
        &self.consumers
    }

    pub fn stop_all(&self) {
        stop_each(&self.consumers);
    }

    /// Resolves once every consumer has stopped.
    pub async fn wait(&self) {
        self.barrier.wait().await;
    }

    pub async fn supervise(self, shutdown: impl Future<Output = ()>) {
        tokio::select! {
            _ = shutdown => {
                tracing::info!(consumers = self.consumers.len(), "shutdown requested, stopping consumers");
                self.stop_all();
            }
            _ = self.barrier.wait() => {}
        }
        self.wait().await;
        tracing::info!("all consumers stopped");
    }
}
