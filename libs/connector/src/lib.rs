//! NSQ topic → OpenFaaS function bridge: config, readiness gate, per-topic
//! handlers and the consumer group supervisor.

pub mod config;
pub mod error;
pub mod handler;
pub mod readiness;
pub mod supervisor;

pub use config::{BrokerAddressSet, ConnectorConfig};
pub use error::ConnectorError;
pub use handler::{SequenceCounter, TopicMessageHandler};
pub use readiness::BrokerReadinessGate;
pub use supervisor::{
    CompletionBarrier, ConsumerFactory, ConsumerGroupSupervisor, NsqConsumerFactory, RunningGroup,
    TopicConsumer,
};
