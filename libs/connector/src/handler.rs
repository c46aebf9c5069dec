use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use faas_controller::Invoker;
use nsq_client::{Handler, Message};

/// Counter values wrap to zero at this bound.
pub const SEQUENCE_BOUND: u32 = i32::MAX as u32;

/// Diagnostic message counter owned by one handler.
///
/// Increments are not atomic with respect to each other; concurrent
/// deliveries may observe the same value.
#[derive(Debug)]
pub struct SequenceCounter {
    value: AtomicU32,
    bound: u32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::with_bound(SEQUENCE_BOUND)
    }

    pub fn with_bound(bound: u32) -> Self {
        Self { value: AtomicU32::new(0), bound: bound.max(1) }
    }

    pub fn next(&self) -> u32 {
        let next = (self.value.load(Ordering::Relaxed) + 1) % self.bound;
        self.value.store(next, Ordering::Relaxed);
        next
    }
}

/// Forwards every message of one topic to the invoker, then acknowledges it.
pub struct TopicMessageHandler {
    topic: String,
    invoker: Arc<dyn Invoker>,
    sequence: SequenceCounter,
}

impl std::fmt::Debug for TopicMessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicMessageHandler").field("topic", &self.topic).finish()
    }
}

impl TopicMessageHandler {
    pub fn new(topic: impl Into<String>, invoker: Arc<dyn Invoker>) -> Self {
        Self { topic: topic.into(), invoker, sequence: SequenceCounter::new() }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Invoke, then acknowledge. The message is acknowledged even when the
    /// invocation fails: delivery is at-most-once past this point.
    pub async fn on_message(&self, message: &Message) {
        let seq = self.sequence.next();
        tracing::info!(
            seq,
            topic = %self.topic,
            nsqd = %message.nsqd_address,
            payload = %String::from_utf8_lossy(&message.body),
            "message received"
        );

        if let Err(e) = self.invoker.invoke(&self.topic, message.body.clone()).await {
            tracing::debug!(topic = %self.topic, error = %e, "invoke failed");
        }

        if let Err(e) = message.finish().await {
            tracing::warn!(topic = %self.topic, id = %message.id, error = %e, "acknowledge failed");
        }
    }
}

impl Handler for TopicMessageHandler {
    fn handle_message<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.on_message(message))
    }
}
