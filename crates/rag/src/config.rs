use serde::{Deserialize, Serialize};

/// Blend of the three ranking signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub lexical: f64,
    pub vector: f64,
    pub keyword: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            lexical: 0.5,
            vector: 0.3,
            keyword: 0.2,
        }
    }
}

impl ScoreWeights {
    /// Non-decreasing in every component as long as the weights are non-negative.
    pub fn combine(&self, lexical: f64, vector: f64, keyword: f64) -> f64 {
        self.lexical * lexical + self.vector * vector + self.keyword * keyword
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Length of the term vectors fed to the nearest-neighbour index.
    pub dim: usize,
    /// Fraction of the best hybrid score a result needs to survive filtering.
    pub score_threshold: f64,
    /// Sentences kept on each side of a matching sentence (one more is added).
    pub context_window: usize,
    pub weights: ScoreWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            dim: policy_rag_core::DEFAULT_DIM,
            score_threshold: 0.5,
            context_window: 1,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub command: String,
    pub dpi: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: "pdftoppm".to_string(),
            dpi: 144,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighlightConfig {
    /// Page size used for sources that are not PDFs.
    pub page_width_pts: f64,
    pub page_height_pts: f64,
    pub alpha: f32,
    /// Empty the output directory before rendering.
    pub clear_output: bool,
    pub renderer: RendererConfig,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            page_width_pts: 595.3,
            page_height_pts: 841.9,
            alpha: 0.5,
            clear_output: false,
            renderer: RendererConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub use_llm: bool,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            max_attempts: 2,
            base_delay_ms: 200,
        }
    }
}
