//! Contract between the session pipeline and an inference engine.

use std::path::Path;

use crate::chat::ChatMessage;
use crate::error::Result;
use crate::sampler::SamplingParams;

/// Raw token id.
pub type Token = i32;

/// Context-creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Context window capacity in tokens.
    pub n_ctx: u32,
    /// Maximum tokens accepted by a single decode call.
    pub n_batch: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 40960,
            n_batch: 40960,
        }
    }
}

/// The narrow call surface a [`Session`](crate::session::Session) drives.
///
/// Everything heavy (weights, KV state, sampler chains) lives behind the
/// three opaque handle types; the session only holds handles and calls
/// back in through this trait. Implementations are expected to keep
/// [`apply_chat_template`](Engine::apply_chat_template) and
/// [`tokenize`](Engine::tokenize) pure: rendering or tokenizing the same
/// input twice must yield identical output, since the session slices
/// prompt deltas out of re-rendered transcripts.
pub trait Engine {
    type Model;
    type Context;
    type Sampler;

    //  Setup

    fn load_model(&self, path: &Path) -> Result<Self::Model>;

    fn create_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context>;

    /// Compose the sampling chain, in fixed order: min-p filter (keeping
    /// at least one candidate), temperature rescale, then a categorical
    /// draw seeded with [`SamplingParams::seed_or_default`].
    fn build_sampler(&self, model: &Self::Model, params: &SamplingParams) -> Self::Sampler;

    //  Text and tokens

    /// Tokenize `text`. `add_special` prepends sequence-start specials
    /// (BOS); `parse_special` lets control markers in the text map to
    /// their token ids instead of being split literally.
    fn tokenize(
        &self,
        model: &Self::Model,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>>;

    /// Text fragment for one token. Must be valid UTF-8; control tokens
    /// may render empty.
    fn token_to_piece(&self, model: &Self::Model, token: Token) -> Result<String>;

    fn is_eog(&self, model: &Self::Model, token: Token) -> bool;

    /// Render messages through the model's chat template. `add_assistant`
    /// appends the empty assistant turn that cues generation.
    fn apply_chat_template(
        &self,
        model: &Self::Model,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String>;

    //  Decode and sample

    /// Fold a batch of tokens into the context's sequence state.
    fn decode(&self, context: &mut Self::Context, tokens: &[Token]) -> Result<()>;

    /// Sample the next token from the logits of the last decode.
    fn sample(&self, sampler: &mut Self::Sampler, context: &Self::Context) -> Token;

    /// Number of positions already folded into the sequence state.
    fn n_past(&self, context: &Self::Context) -> u32;

    fn n_ctx(&self, context: &Self::Context) -> u32;

    /// Drop all sequence state so the context can start a fresh
    /// conversation.
    fn clear_memory(&self, context: &mut Self::Context);
}
