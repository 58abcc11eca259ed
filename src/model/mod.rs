use futures::stream::BoxStream;
use thiserror::Error;

pub mod ollama;

/// Failure talking to the upstream runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("request timeout")]
    Timeout,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Decode(String),
}

impl BackendError {
    /// Reason recorded alongside a fallback response.
    pub fn reason(&self) -> String {
        match self {
            BackendError::Unavailable(_) => "Ollama service unavailable".to_string(),
            BackendError::Timeout => "Request timeout".to_string(),
            BackendError::Status(code) => format!("API error: {code}"),
            BackendError::Transport(msg) | BackendError::Decode(msg) => msg.clone(),
        }
    }
}

/// One piece of a streamed generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub token: String,
    pub done: bool,
}

pub type TokenStream = BoxStream<'static, Result<Fragment, BackendError>>;

#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    /// Names of the models the runtime has pulled. An error means the runtime is unreachable.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, BackendError>;

    async fn generate_stream(&self, model: &str, prompt: &str) -> Result<TokenStream, BackendError>;
}
