//! Deterministic in-memory engine for tests and harness binaries.
//!
//! `StubEngine` stands in for a real llama.cpp-style engine: it accepts
//! any model path, tokenizes at character level, renders a fixed
//! ChatML-style template, and "generates" by replaying a configured
//! script of canned replies, one reply per turn, each terminated by an
//! end-of-generation token. Every decoded batch is recorded so tests can
//! assert exactly what a session fed the engine.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::chat::ChatMessage;
use crate::engine::{ContextParams, Engine, Token};
use crate::error::{LlmError, Result};
use crate::sampler::SamplingParams;

/// Sequence-start control token, just past the Unicode scalar range.
pub const BOS: Token = 0x0011_0000;
/// End-of-generation control token.
pub const EOG: Token = 0x0011_0001;

#[derive(Debug, Clone, Copy, Default)]
struct Knobs {
    fail_load: bool,
    fail_context: bool,
    fail_tokenize: bool,
    fail_template: bool,
    /// Fail only renders without the generation prompt.
    fail_template_bare: bool,
    /// Render only the last `n` messages.
    template_window: Option<usize>,
    /// 1-based index of the decode call that should fail.
    fail_decode_at: Option<usize>,
}

/// Scripted engine; cloning shares the recorders, so a test can hold a
/// clone of the engine it handed to a session and inspect traffic later.
#[derive(Clone, Default)]
pub struct StubEngine {
    replies: Vec<String>,
    knobs: Knobs,
    decoded: Arc<Mutex<Vec<Vec<Token>>>>,
    sampler_params: Arc<Mutex<Vec<SamplingParams>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose turns replay `replies` in order; once the script is
    /// exhausted every turn ends immediately with an empty reply.
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    //  Failure injection

    pub fn fail_load(mut self) -> Self {
        self.knobs.fail_load = true;
        self
    }

    pub fn fail_context(mut self) -> Self {
        self.knobs.fail_context = true;
        self
    }

    pub fn fail_tokenize(mut self) -> Self {
        self.knobs.fail_tokenize = true;
        self
    }

    pub fn fail_template(mut self) -> Self {
        self.knobs.fail_template = true;
        self
    }

    /// Fail only the commit-time render (no generation prompt), leaving
    /// the turn-setup render working.
    pub fn fail_template_bare(mut self) -> Self {
        self.knobs.fail_template_bare = true;
        self
    }

    /// Render only the last `n` messages, like a template that drops old
    /// turns; renders can then come out shorter than what a session has
    /// already consumed.
    pub fn template_window(mut self, n: usize) -> Self {
        self.knobs.template_window = Some(n);
        self
    }

    /// Make the `nth` decode call (1-based, over the context lifetime)
    /// fail.
    pub fn fail_decode_at(mut self, nth: usize) -> Self {
        self.knobs.fail_decode_at = Some(nth);
        self
    }

    //  Recorders

    /// Every batch submitted to [`Engine::decode`], in call order,
    /// including batches whose decode was scripted to fail.
    pub fn decoded_batches(&self) -> Vec<Vec<Token>> {
        lock(&self.decoded).clone()
    }

    /// Parameters seen by [`Engine::build_sampler`], in call order.
    pub fn sampler_params_seen(&self) -> Vec<SamplingParams> {
        lock(&self.sampler_params).clone()
    }

    /// Decode a token stream back to text. Control tokens render empty.
    pub fn text_of(tokens: &[Token]) -> String {
        tokens
            .iter()
            .filter_map(|&t| u32::try_from(t).ok().and_then(char::from_u32))
            .collect()
    }

    fn reply_script(&self) -> VecDeque<VecDeque<Token>> {
        self.replies
            .iter()
            .map(|r| r.chars().map(|c| c as Token).collect())
            .collect()
    }
}

pub struct StubModel {
    script: VecDeque<VecDeque<Token>>,
    knobs: Knobs,
}

pub struct StubContext {
    n_ctx: u32,
    n_past: u32,
    decode_calls: usize,
    fail_decode_at: Option<usize>,
}

pub struct StubSampler {
    script: VecDeque<VecDeque<Token>>,
    current: Option<VecDeque<Token>>,
}

impl Engine for StubEngine {
    type Model = StubModel;
    type Context = StubContext;
    type Sampler = StubSampler;

    fn load_model(&self, path: &Path) -> Result<StubModel> {
        if self.knobs.fail_load {
            return Err(LlmError::ModelLoadFailed {
                path: path.display().to_string(),
                reason: "scripted failure".into(),
            });
        }
        Ok(StubModel {
            script: self.reply_script(),
            knobs: self.knobs,
        })
    }

    fn create_context(&self, _model: &StubModel, params: &ContextParams) -> Result<StubContext> {
        if self.knobs.fail_context {
            return Err(LlmError::ContextInitFailed("scripted failure".into()));
        }
        if params.n_ctx == 0 {
            return Err(LlmError::ContextInitFailed("zero-capacity window".into()));
        }
        Ok(StubContext {
            n_ctx: params.n_ctx,
            n_past: 0,
            decode_calls: 0,
            fail_decode_at: self.knobs.fail_decode_at,
        })
    }

    fn build_sampler(&self, model: &StubModel, params: &SamplingParams) -> StubSampler {
        lock(&self.sampler_params).push(params.clone());
        StubSampler {
            script: model.script.clone(),
            current: None,
        }
    }

    fn tokenize(
        &self,
        model: &StubModel,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>> {
        if model.knobs.fail_tokenize {
            return Err(LlmError::TokenizeFailed("scripted failure".into()));
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.chars().map(|c| c as Token));
        Ok(tokens)
    }

    fn token_to_piece(&self, _model: &StubModel, token: Token) -> Result<String> {
        if token == BOS || token == EOG {
            return Ok(String::new());
        }
        u32::try_from(token)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .ok_or_else(|| LlmError::TokenizeFailed(format!("token {token} has no piece")))
    }

    fn is_eog(&self, _model: &StubModel, token: Token) -> bool {
        token == EOG
    }

    fn apply_chat_template(
        &self,
        model: &StubModel,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String> {
        if model.knobs.fail_template || (model.knobs.fail_template_bare && !add_assistant) {
            return Err(LlmError::TemplateFailed("scripted failure".into()));
        }
        let window = match model.knobs.template_window {
            Some(n) => &messages[messages.len().saturating_sub(n)..],
            None => messages,
        };
        let mut out = String::new();
        for msg in window {
            out.push_str("<|");
            out.push_str(msg.role.as_str());
            out.push_str("|>\n");
            out.push_str(&msg.content);
            out.push_str("<|end|>\n");
        }
        if add_assistant {
            out.push_str("<|assistant|>\n");
        }
        Ok(out)
    }

    fn decode(&self, context: &mut StubContext, tokens: &[Token]) -> Result<()> {
        lock(&self.decoded).push(tokens.to_vec());
        context.decode_calls += 1;
        if context.fail_decode_at == Some(context.decode_calls) {
            return Err(LlmError::DecodeFailed(-3));
        }
        context.n_past += tokens.len() as u32;
        Ok(())
    }

    fn sample(&self, sampler: &mut StubSampler, _context: &StubContext) -> Token {
        if let Some(current) = &mut sampler.current {
            return match current.pop_front() {
                Some(token) => token,
                None => {
                    sampler.current = None;
                    EOG
                }
            };
        }
        match sampler.script.pop_front() {
            Some(mut reply) => match reply.pop_front() {
                Some(token) => {
                    sampler.current = Some(reply);
                    token
                }
                None => EOG,
            },
            None => EOG,
        }
    }

    fn n_past(&self, context: &StubContext) -> u32 {
        context.n_past
    }

    fn n_ctx(&self, context: &StubContext) -> u32 {
        context.n_ctx
    }

    fn clear_memory(&self, context: &mut StubContext) {
        context.n_past = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(engine: &StubEngine) -> (StubModel, StubContext, StubSampler) {
        let model = engine.load_model(Path::new("stub.gguf")).unwrap();
        let ctx = engine
            .create_context(&model, &ContextParams::default())
            .unwrap();
        let sampler = engine.build_sampler(&model, &SamplingParams::default());
        (model, ctx, sampler)
    }

    #[test]
    fn tokenize_round_trips_text() {
        let engine = StubEngine::new();
        let (model, _ctx, _sampler) = loaded(&engine);

        let tokens = engine.tokenize(&model, "héllo ☃", false, true).unwrap();
        assert_eq!(StubEngine::text_of(&tokens), "héllo ☃");

        let with_bos = engine.tokenize(&model, "hi", true, true).unwrap();
        assert_eq!(with_bos[0], BOS);
        assert_eq!(StubEngine::text_of(&with_bos), "hi");
    }

    #[test]
    fn control_tokens_render_empty() {
        let engine = StubEngine::new();
        let (model, _ctx, _sampler) = loaded(&engine);
        assert_eq!(engine.token_to_piece(&model, BOS).unwrap(), "");
        assert_eq!(engine.token_to_piece(&model, EOG).unwrap(), "");
        assert!(engine.token_to_piece(&model, -1).is_err());
    }

    #[test]
    fn template_without_prompt_is_prefix_of_with_prompt() {
        let engine = StubEngine::new();
        let (model, _ctx, _sampler) = loaded(&engine);
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi"),
        ];
        let bare = engine.apply_chat_template(&model, &messages, false).unwrap();
        let cued = engine.apply_chat_template(&model, &messages, true).unwrap();
        assert!(cued.starts_with(&bare));
        assert_eq!(&cued[bare.len()..], "<|assistant|>\n");

        // Rendering is pure.
        assert_eq!(
            bare,
            engine.apply_chat_template(&model, &messages, false).unwrap()
        );
    }

    #[test]
    fn sampler_replays_script_one_reply_per_turn() {
        let engine = StubEngine::scripted(["ab", "", "c"]);
        let (model, ctx, mut sampler) = loaded(&engine);

        assert_eq!(engine.sample(&mut sampler, &ctx), 'a' as Token);
        assert_eq!(engine.sample(&mut sampler, &ctx), 'b' as Token);
        assert_eq!(engine.sample(&mut sampler, &ctx), EOG);
        // Empty scripted reply: immediate end of generation.
        assert_eq!(engine.sample(&mut sampler, &ctx), EOG);
        assert_eq!(engine.sample(&mut sampler, &ctx), 'c' as Token);
        assert_eq!(engine.sample(&mut sampler, &ctx), EOG);
        // Script exhausted.
        assert_eq!(engine.sample(&mut sampler, &ctx), EOG);
        assert!(engine.is_eog(&model, EOG));
    }

    #[test]
    fn decode_advances_and_records() {
        let engine = StubEngine::new();
        let (_model, mut ctx, _sampler) = loaded(&engine);

        engine.decode(&mut ctx, &[BOS, 'h' as Token]).unwrap();
        engine.decode(&mut ctx, &['i' as Token]).unwrap();
        assert_eq!(engine.n_past(&ctx), 3);
        assert_eq!(
            engine.decoded_batches(),
            vec![vec![BOS, 'h' as Token], vec!['i' as Token]]
        );

        engine.clear_memory(&mut ctx);
        assert_eq!(engine.n_past(&ctx), 0);
    }

    #[test]
    fn scripted_decode_failure() {
        let engine = StubEngine::new().fail_decode_at(2);
        let (_model, mut ctx, _sampler) = loaded(&engine);
        engine.decode(&mut ctx, &[1]).unwrap();
        assert_eq!(
            engine.decode(&mut ctx, &[2]),
            Err(LlmError::DecodeFailed(-3))
        );
    }
}
