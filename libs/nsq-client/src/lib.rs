//! Minimal NSQ TCP client: consumer with nsqlookupd discovery, and producer.

pub mod codec;
pub mod config;
mod conn;
pub mod consumer;
pub mod duration;
pub mod error;
mod lookup;
pub mod message;
pub mod producer;

pub use codec::MessageId;
pub use config::{Config, is_valid_name};
pub use consumer::{Consumer, ConsumerState, Handler};
pub use duration::parse_duration;
pub use error::NsqError;
pub use message::Message;
pub use producer::Producer;
