use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Failed to create context: {0}")]
    ContextInitFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Chat template failed: {0}")]
    TemplateFailed(String),

    #[error("Decode failed with code {0}")]
    DecodeFailed(i32),

    #[error("Context window exhausted: {n_past} + {pending} pending exceeds capacity {n_ctx}")]
    ContextExceeded { n_past: u32, pending: u32, n_ctx: u32 },

    #[error("Response of {size} bytes exceeds the 65535-byte limit")]
    ResponseTooLarge { size: usize },

    #[error("A generation turn is already in progress")]
    SessionBusy,

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("No generation turn in progress")]
    NoActiveTurn,
}

pub type Result<T> = std::result::Result<T, LlmError>;
