use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NsqError {
    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("dial {addr}: timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("dial {addr}: {source}")]
    Dial { addr: String, source: std::io::Error },

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("nsqd: {0}")]
    Broker(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("lookup {addr}: {detail}")]
    Lookup { addr: String, detail: String },

    #[error("identify body: {0}")]
    Identify(#[from] serde_json::Error),

    #[error("consumer '{0}' already has a handler")]
    HandlerAlreadySet(String),

    #[error("consumer '{0}' has no handler")]
    NoHandler(String),

    #[error("consumer '{0}' is stopped")]
    Stopped(String),

    #[error("no {0} addresses given")]
    NoAddresses(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
