use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "llm-cli",
    version,
    about = "Interactive chat against a scripted stub engine"
)]
pub struct Cli {
    /// Path handed to the engine's model loader (the stub accepts any).
    #[arg(default_value = "stub.gguf")]
    pub model: std::path::PathBuf,

    /// Context window capacity in tokens.
    #[arg(long = "ctx-size", default_value_t = 40960, env = "LLM_CTX_SIZE")]
    pub ctx_size: u32,

    /// Sampling temperature.
    #[arg(long, default_value_t = 0.6)]
    pub temp: f32,

    /// Min-p cutoff.
    #[arg(long = "min-p", default_value_t = 0.0)]
    pub min_p: f32,

    /// Sampling seed (defaults to the engine's fixed seed).
    #[arg(long)]
    pub seed: Option<u32>,

    /// System prompt seeded into the conversation.
    #[arg(long)]
    pub system: Option<String>,

    /// JSON file holding an array of canned replies for the stub engine.
    #[arg(long, env = "LLM_SCRIPT")]
    pub script: Option<std::path::PathBuf>,
}
