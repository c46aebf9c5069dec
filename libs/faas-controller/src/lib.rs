//! Gateway side of the bridge: topic → function routing and invocation.

pub mod config;
pub mod controller;
pub mod error;
pub mod topic_map;

pub use config::{ControllerConfig, GatewayCredentials};
pub use controller::{Controller, Invoker};
pub use error::ControllerError;
pub use topic_map::{FunctionStatus, TopicMap};
