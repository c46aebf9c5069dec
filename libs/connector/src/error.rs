use faas_controller::ControllerError;
use nsq_client::NsqError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(r#"Provide a list of topics i.e. topics="payment_published,slack_joined""#)]
    NoTopics,

    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("create consumer for topic '{topic}': {source}")]
    CreateConsumer { topic: String, source: NsqError },

    #[error("connect consumer for topic '{topic}': {source}")]
    ConnectConsumer { topic: String, source: NsqError },

    #[error("controller: {0}")]
    Controller(#[from] ControllerError),
}
