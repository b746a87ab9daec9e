//! Chat session pipeline over a pluggable llama.cpp-style engine.
//!
//! Everything heavy (weights, KV state, sampling internals) stays behind
//! the [`Engine`] trait; this crate owns the conversational machinery:
//! message history, incremental chat-template deltas, the token-by-token
//! decode loop, and blocking/streaming turn APIs.

pub mod chat;
pub mod engine;
pub mod error;
pub mod generate;
pub mod sampler;
pub mod session;
pub mod stub;

pub use chat::{ChatMessage, Role};
pub use engine::{ContextParams, Engine, Token};
pub use error::{LlmError, Result};
pub use generate::{GenerateEvent, generate_events};
pub use sampler::{DEFAULT_SEED, SamplingParams};
pub use session::{Completion, MAX_RESPONSE_BYTES, Session, SessionConfig, TokenEvent};
pub use stub::StubEngine;
