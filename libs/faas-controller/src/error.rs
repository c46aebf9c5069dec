#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("http client: {0}")]
    Client(String),

    #[error("list functions ({url}): {detail}")]
    ListFunctions { url: String, detail: String },

    #[error("credentials ({path}): {source}")]
    Credentials { path: String, source: std::io::Error },

    #[error("topic '{topic}': {} invocation(s) failed: {}", .failures.len(), .failures.join("; "))]
    Invocation { topic: String, failures: Vec<String> },
}
