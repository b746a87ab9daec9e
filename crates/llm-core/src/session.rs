//! Chat session pipeline: history, prompt deltas, token-by-token decode.
//!
//! A [`Session`] owns the engine handles for one conversation and drives
//! the whole turn lifecycle. The transcript is rendered through the chat
//! template on every turn, but only the unconsumed suffix (everything past
//! `prev_len`, the byte offset committed by prior turns) is tokenized and
//! fed to the engine, so the KV state is built incrementally and no prompt
//! text is ever decoded twice.

use std::path::Path;

use tracing::{debug, info, trace, warn};

use crate::chat::ChatMessage;
use crate::engine::{ContextParams, Engine, Token};
use crate::error::{LlmError, Result};
use crate::sampler::SamplingParams;

/// Hard cap on a blocking-generate response, in bytes.
pub const MAX_RESPONSE_BYTES: usize = 65535;

fn default_n_ctx() -> u32 {
    40960
}

/// Session construction parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Context window capacity. The per-call decode batch limit matches
    /// it, so a whole turn prompt fits in one decode call.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Seeded into history as a system message when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            sampling: SamplingParams::default(),
            system_prompt: None,
        }
    }
}

/// Final result of a completed generation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One step of a pull-streamed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// Next decoded fragment of the response.
    Piece(String),
    /// End of generation; the assistant message is committed to history.
    Done(Completion),
}

/// Engine handles for a loaded model. Field order is drop order: sampler,
/// then context, then model.
struct Loaded<E: Engine> {
    sampler: E::Sampler,
    context: E::Context,
    model: E::Model,
}

struct StreamState {
    /// Tokens to decode on the next step: the whole prompt delta right
    /// after `send`, then exactly the last sampled token.
    pending: Vec<Token>,
    response: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    /// History length and consumed offset from before this turn, for
    /// rollback.
    history_mark: usize,
    prev_len_mark: usize,
}

enum TurnState {
    Idle,
    Streaming(StreamState),
    /// A fatal condition ended the conversation; the error is re-yielded
    /// on every generation call until `reset`.
    Poisoned(LlmError),
}

/// A single conversation against one loaded model.
///
/// Not `Sync`: hosts that share a session across tasks serialize access
/// externally (a mutex at the service layer).
pub struct Session<E: Engine> {
    loaded: Option<Loaded<E>>,
    messages: Vec<ChatMessage>,
    prev_len: usize,
    turn: TurnState,
    config: SessionConfig,
    engine: E,
}

impl<E: Engine> Session<E> {
    /// Create an empty session. Never fails; loading the model is a
    /// separate step.
    pub fn new(engine: E, config: SessionConfig) -> Self {
        let mut messages = Vec::new();
        if let Some(prompt) = &config.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        Self {
            loaded: None,
            messages,
            prev_len: 0,
            turn: TurnState::Idle,
            config,
            engine,
        }
    }

    //  Lifecycle

    /// Load model weights and stand up a context and sampler chain.
    ///
    /// Replaces any previously loaded model; the old handles are released
    /// first (sampler, then context, then model). History is kept, but the
    /// consumed-transcript offset restarts at zero so the next turn
    /// re-feeds the whole conversation to the fresh context. Any poisoned
    /// state is cleared.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.loaded = None;
        self.prev_len = 0;
        self.turn = TurnState::Idle;

        let model = self.engine.load_model(path)?;
        let params = ContextParams {
            n_ctx: self.config.n_ctx,
            n_batch: self.config.n_ctx,
        };
        let context = self.engine.create_context(&model, &params)?;
        let sampler = self.engine.build_sampler(&model, &self.config.sampling);
        self.loaded = Some(Loaded {
            sampler,
            context,
            model,
        });

        info!(path = %path.display(), n_ctx = self.config.n_ctx, "Model loaded");
        Ok(())
    }

    /// Release the engine handles (sampler, context, model, in that
    /// order) and consume the session.
    pub fn close(self) {
        drop(self);
    }

    /// Discard history, transcript bookkeeping, any in-flight or poisoned
    /// turn, and the engine's sequence memory. The sampler chain is
    /// rebuilt so the draw sequence restarts from its seed.
    pub fn reset(&mut self) {
        self.messages.clear();
        if let Some(prompt) = &self.config.system_prompt {
            self.messages.push(ChatMessage::system(prompt.clone()));
        }
        self.prev_len = 0;
        self.turn = TurnState::Idle;
        if let Some(loaded) = self.loaded.as_mut() {
            self.engine.clear_memory(&mut loaded.context);
            loaded.sampler = self.engine.build_sampler(&loaded.model, &self.config.sampling);
        }
        debug!("Session reset");
    }

    //  Accessors

    /// True once `load_model` has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Chat history, oldest first. Failed turns leave no trace here.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Byte offset of the rendered transcript already fed to the engine.
    pub fn transcript_offset(&self) -> usize {
        self.prev_len
    }

    /// The fatal error that ended the conversation, if any.
    pub fn poisoned(&self) -> Option<&LlmError> {
        match &self.turn {
            TurnState::Poisoned(err) => Some(err),
            _ => None,
        }
    }

    //  Generation

    /// Run one full turn: append `user_text` to history, feed the prompt
    /// delta, decode until end of generation, commit the assistant reply.
    ///
    /// Responses over [`MAX_RESPONSE_BYTES`] are rejected whole: the error
    /// carries no partial text and history is left exactly as before the
    /// call.
    pub fn generate(&mut self, user_text: &str) -> Result<Completion> {
        let history_mark = self.messages.len();
        let prev_len_mark = self.prev_len;
        self.send(user_text)?;
        loop {
            match self.next_token()? {
                TokenEvent::Piece(_) => {}
                TokenEvent::Done(completion) => {
                    if completion.text.len() > MAX_RESPONSE_BYTES {
                        self.messages.truncate(history_mark);
                        self.prev_len = prev_len_mark;
                        warn!(size = completion.text.len(), "Response over size cap, turn dropped");
                        return Err(LlmError::ResponseTooLarge {
                            size: completion.text.len(),
                        });
                    }
                    return Ok(completion);
                }
            }
        }
    }

    /// Queue a user turn for pull-streaming with [`next_token`](Self::next_token).
    ///
    /// Fails with `SessionBusy` while another turn is in progress. On any
    /// failure the user message is rolled back and history is unchanged.
    pub fn send(&mut self, user_text: &str) -> Result<()> {
        match &self.turn {
            TurnState::Idle => {}
            TurnState::Streaming(_) => return Err(LlmError::SessionBusy),
            TurnState::Poisoned(err) => return Err(err.clone()),
        }
        if self.loaded.is_none() {
            return Err(LlmError::ModelNotLoaded);
        }

        let history_mark = self.messages.len();
        let prev_len_mark = self.prev_len;
        self.messages.push(ChatMessage::user(user_text));

        match self.prepare_turn() {
            Ok(pending) => {
                debug!(prompt_tokens = pending.len(), "Turn queued");
                self.turn = TurnState::Streaming(StreamState {
                    prompt_tokens: pending.len() as u32,
                    pending,
                    response: String::new(),
                    completion_tokens: 0,
                    history_mark,
                    prev_len_mark,
                });
                Ok(())
            }
            Err(err) => {
                self.messages.truncate(history_mark);
                Err(err)
            }
        }
    }

    /// Advance a pull-streamed turn by one token.
    ///
    /// Yields [`TokenEvent::Piece`] per decoded fragment and
    /// [`TokenEvent::Done`] once the engine emits end of generation, at
    /// which point the session is idle again.
    pub fn next_token(&mut self) -> Result<TokenEvent> {
        match &self.turn {
            TurnState::Streaming(_) => {}
            TurnState::Idle => return Err(LlmError::NoActiveTurn),
            TurnState::Poisoned(err) => return Err(err.clone()),
        }
        match self.decode_one() {
            Ok(Some(piece)) => Ok(TokenEvent::Piece(piece)),
            Ok(None) => self.finalize_turn().map(TokenEvent::Done),
            Err(err) => {
                self.abort_turn(&err);
                Err(err)
            }
        }
    }

    /// Stream one turn through a callback; the callback returning `false`
    /// cancels the turn.
    ///
    /// Returns `Ok(None)` on cancellation. A cancelled turn is abandoned
    /// mid-decode: call [`reset`](Self::reset) before using the session
    /// again.
    pub fn generate_stream<F>(
        &mut self,
        user_text: &str,
        mut on_token: F,
    ) -> Result<Option<Completion>>
    where
        F: FnMut(&str) -> bool,
    {
        self.send(user_text)?;
        loop {
            match self.next_token()? {
                TokenEvent::Piece(piece) => {
                    if !on_token(&piece) {
                        debug!("Turn cancelled by callback");
                        return Ok(None);
                    }
                }
                TokenEvent::Done(completion) => return Ok(Some(completion)),
            }
        }
    }

    //  Turn internals

    /// Render the full transcript, slice the unconsumed delta, tokenize
    /// it.
    fn prepare_turn(&self) -> Result<Vec<Token>> {
        let loaded = self.loaded.as_ref().ok_or(LlmError::ModelNotLoaded)?;
        let formatted = self
            .engine
            .apply_chat_template(&loaded.model, &self.messages, true)?;
        let delta = formatted.get(self.prev_len..).ok_or_else(|| {
            LlmError::TemplateFailed(format!(
                "consumed prefix {} is past the end or not a char boundary of the {}-byte render",
                self.prev_len,
                formatted.len()
            ))
        })?;
        // Sequence-start specials only before anything has been decoded.
        let is_first = self.engine.n_past(&loaded.context) == 0;
        self.engine.tokenize(&loaded.model, delta, is_first, true)
    }

    /// Decode the pending batch and sample once. `None` means end of
    /// generation.
    fn decode_one(&mut self) -> Result<Option<String>> {
        let loaded = self.loaded.as_mut().ok_or(LlmError::ModelNotLoaded)?;
        let TurnState::Streaming(st) = &mut self.turn else {
            return Err(LlmError::NoActiveTurn);
        };

        let n_past = self.engine.n_past(&loaded.context);
        let n_ctx = self.engine.n_ctx(&loaded.context);
        let pending = st.pending.len() as u32;
        if n_past + pending > n_ctx {
            return Err(LlmError::ContextExceeded {
                n_past,
                pending,
                n_ctx,
            });
        }

        self.engine.decode(&mut loaded.context, &st.pending)?;
        let token = self.engine.sample(&mut loaded.sampler, &loaded.context);
        if self.engine.is_eog(&loaded.model, token) {
            return Ok(None);
        }

        let piece = self.engine.token_to_piece(&loaded.model, token)?;
        trace!(token, "Sampled piece");
        st.response.push_str(&piece);
        st.completion_tokens += 1;
        st.pending.clear();
        st.pending.push(token);
        Ok(Some(piece))
    }

    /// Commit the finished turn: append the assistant message and advance
    /// the consumed offset past it (rendered without the generation
    /// prompt).
    fn finalize_turn(&mut self) -> Result<Completion> {
        let TurnState::Streaming(st) = std::mem::replace(&mut self.turn, TurnState::Idle) else {
            return Err(LlmError::NoActiveTurn);
        };
        self.messages.push(ChatMessage::assistant(st.response.clone()));

        let loaded = self.loaded.as_ref().ok_or(LlmError::ModelNotLoaded)?;
        match self
            .engine
            .apply_chat_template(&loaded.model, &self.messages, false)
        {
            Ok(rendered) => {
                self.prev_len = rendered.len();
                debug!(
                    prompt_tokens = st.prompt_tokens,
                    completion_tokens = st.completion_tokens,
                    prev_len = self.prev_len,
                    "Turn committed"
                );
                Ok(Completion {
                    text: st.response,
                    prompt_tokens: st.prompt_tokens,
                    completion_tokens: st.completion_tokens,
                })
            }
            Err(err) => {
                self.messages.truncate(st.history_mark);
                Err(err)
            }
        }
    }

    /// Roll the failed turn out of history. Decode-level conditions
    /// poison the session; tokenize/template level ones leave it
    /// reusable.
    fn abort_turn(&mut self, err: &LlmError) {
        if let TurnState::Streaming(st) = std::mem::replace(&mut self.turn, TurnState::Idle) {
            self.messages.truncate(st.history_mark);
            self.prev_len = st.prev_len_mark;
        }
        match err {
            LlmError::ContextExceeded { .. } | LlmError::DecodeFailed(_) => {
                warn!(error = %err, "Session poisoned");
                self.turn = TurnState::Poisoned(err.clone());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubEngine;

    fn ready(engine: StubEngine) -> Session<StubEngine> {
        let mut session = Session::new(engine, SessionConfig::default());
        session.load_model("stub.gguf").unwrap();
        session
    }

    #[test]
    fn generation_requires_a_model() {
        let mut session = Session::new(StubEngine::new(), SessionConfig::default());
        assert!(!session.is_loaded());
        assert_eq!(session.generate("hi"), Err(LlmError::ModelNotLoaded));
        assert_eq!(session.send("hi"), Err(LlmError::ModelNotLoaded));
        assert!(session.messages().is_empty());
    }

    #[test]
    fn load_failures_surface_and_leave_session_unloaded() {
        let mut session = Session::new(StubEngine::new().fail_load(), SessionConfig::default());
        assert!(matches!(
            session.load_model("missing.gguf"),
            Err(LlmError::ModelLoadFailed { .. })
        ));
        assert!(!session.is_loaded());

        let mut session = Session::new(StubEngine::new().fail_context(), SessionConfig::default());
        assert!(matches!(
            session.load_model("stub.gguf"),
            Err(LlmError::ContextInitFailed(_))
        ));
        assert!(!session.is_loaded());
    }

    #[test]
    fn send_while_streaming_is_rejected() {
        let mut session = ready(StubEngine::scripted(["hello"]));
        session.send("hi").unwrap();
        assert_eq!(session.send("again"), Err(LlmError::SessionBusy));
        assert_eq!(session.generate("again"), Err(LlmError::SessionBusy));

        // Only the queued user message is in history so far.
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn next_token_without_send_is_rejected() {
        let mut session = ready(StubEngine::scripted(["hello"]));
        assert_eq!(session.next_token(), Err(LlmError::NoActiveTurn));
    }

    #[test]
    fn system_prompt_survives_reset() {
        let config = SessionConfig {
            system_prompt: Some("be brief".into()),
            ..SessionConfig::default()
        };
        let mut session = Session::new(StubEngine::scripted(["ok"]), config);
        session.load_model("stub.gguf").unwrap();
        assert_eq!(session.messages().len(), 1);

        session.generate("hi").unwrap();
        assert_eq!(session.messages().len(), 3);

        session.reset();
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].content, "be brief");
        assert_eq!(session.transcript_offset(), 0);
    }

    #[test]
    fn reload_replaces_the_model_and_restarts_the_transcript() {
        let mut session = ready(StubEngine::scripted(["one"]));
        session.generate("hi").unwrap();
        assert!(session.transcript_offset() > 0);

        session.load_model("other.gguf").unwrap();
        assert!(session.is_loaded());
        // History is kept but nothing is consumed in the fresh context.
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.transcript_offset(), 0);
    }

    #[test]
    fn reload_clears_a_poisoned_session() {
        let config = SessionConfig {
            n_ctx: 8,
            ..SessionConfig::default()
        };
        let mut session = Session::new(StubEngine::scripted(["irrelevant"]), config);
        session.load_model("stub.gguf").unwrap();
        session.send("hello").unwrap();
        assert!(matches!(
            session.next_token(),
            Err(LlmError::ContextExceeded { .. })
        ));
        assert!(session.poisoned().is_some());

        // Loading a model is the other way out of the poisoned state.
        session.load_model("stub.gguf").unwrap();
        assert!(session.poisoned().is_none());
        session.send("hi").unwrap();
    }
}
