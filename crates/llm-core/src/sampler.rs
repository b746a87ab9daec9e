//! Sampling configuration.

/// Draw seed used when none is configured (`LLAMA_DEFAULT_SEED`).
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// User-facing sampling configuration.
///
/// Engines compose their chain from this in a fixed order: min-p filter
/// (keeping at least one candidate), temperature rescale, then a seeded
/// categorical draw.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temp")]
    pub temperature: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    /// Draw seed; `None` resolves to [`DEFAULT_SEED`].
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_temp() -> f32 {
    0.6
}
fn default_min_p() -> f32 {
    0.0
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temp(),
            min_p: default_min_p(),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn seed_or_default(&self) -> u32 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }
}
