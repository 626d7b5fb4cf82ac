use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::tokenize::Tokenizer;

/// Length of every term vector handed to the vector index.
pub const DEFAULT_DIM: usize = 300;

static PUNCT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"[~—\t @#%!<>,.?":;'{}\[\]_=()|，。？》•●○↓《；‘’：“”【¥ 】…￥！、·（）×`&\\/「」]"#,
    )
    .expect("valid regex")
});

const STOP_WORDS: [&str; 20] = [
    "请问",
    "您",
    "你",
    "我",
    "他",
    "的",
    "是",
    "有",
    "在",
    "为",
    "将",
    "本办法",
    "本条例",
    "相关规定",
    "特此通知",
    "自发布之日起施行",
    "相关部门",
    "各院系",
    "有关单位",
    "全体师生",
];

#[derive(Debug, Clone, Copy)]
pub struct TermWeighterConfig {
    /// Corpus size the document frequencies are measured against.
    pub corpus_size: f64,
    /// Document frequency assumed for terms missing from the table.
    pub unseen_frequency: u64,
    pub entity_boost: f64,
}

impl Default for TermWeighterConfig {
    fn default() -> Self {
        Self {
            corpus_size: 1_000_000.0,
            unseen_frequency: 3,
            entity_boost: 1.5,
        }
    }
}

/// Document frequencies and the named-entity dictionary.
#[derive(Debug, Clone, Default)]
pub struct TermTables {
    pub term_freq: HashMap<String, u64>,
    pub entities: HashMap<String, String>,
}

impl TermTables {
    /// Reads `term.freq` (`term<ws>freq` per line) and `ner.json`
    /// (`{token: label}`). Either file may be missing; that only leaves its
    /// table empty.
    pub fn load(term_freq: Option<&Path>, entities: Option<&Path>) -> Self {
        let mut tables = Self::default();
        if let Some(path) = term_freq {
            match fs::read_to_string(path) {
                Ok(raw) => tables.term_freq = parse_term_freq(&raw),
                Err(err) => warn!(path = %path.display(), "term frequencies not loaded: {err}"),
            }
        }
        if let Some(path) = entities {
            match fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(map) => tables.entities = map,
                Err(err) => warn!(path = %path.display(), "entity dictionary not loaded: {err}"),
            }
        }
        info!(
            terms = tables.term_freq.len(),
            entities = tables.entities.len(),
            "term tables ready"
        );
        tables
    }

    /// Every multi-character term either table knows about.
    pub fn vocabulary(&self) -> impl Iterator<Item = &str> {
        self.term_freq
            .keys()
            .chain(self.entities.keys())
            .map(|k| k.as_str())
    }
}

pub fn parse_term_freq(raw: &str) -> HashMap<String, u64> {
    let mut table = HashMap::new();
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let Some(term) = fields.next() else {
            continue;
        };
        let freq = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        table.insert(term.to_string(), freq);
    }
    table
}

/// Fixed-length vector of term weights.
#[derive(Debug, Clone, PartialEq)]
pub struct TermVector(Vec<f32>);

impl TermVector {
    /// Zero-pads or truncates to exactly `dim` entries.
    pub fn from_weights<I: IntoIterator<Item = f64>>(weights: I, dim: usize) -> Self {
        let mut values: Vec<f32> = weights.into_iter().take(dim).map(|w| w as f32).collect();
        values.resize(dim, 0.0);
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// IDF-style token weighting with a boost for named entities.
#[derive(Clone)]
pub struct TermWeighter {
    tokenizer: Arc<dyn Tokenizer>,
    tables: TermTables,
    stop_words: HashSet<&'static str>,
    config: TermWeighterConfig,
}

impl TermWeighter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, tables: TermTables, config: TermWeighterConfig) -> Self {
        Self {
            tokenizer,
            tables,
            stop_words: STOP_WORDS.iter().copied().collect(),
            config,
        }
    }

    pub fn tables(&self) -> &TermTables {
        &self.tables
    }

    /// Strips punctuation, tokenizes, and drops stop words and lone digits.
    pub fn pretoken(&self, text: &str, keep_numerals: bool, drop_stop_words: bool) -> Vec<String> {
        let cleaned = PUNCT_RE.replace_all(text, " ");
        self.tokenizer
            .tokens(&cleaned)
            .into_iter()
            .filter(|t| !(drop_stop_words && self.stop_words.contains(t.as_str())))
            .filter(|t| keep_numerals || !is_single_digit(t))
            .collect()
    }

    pub fn is_entity(&self, token: &str) -> bool {
        self.tables
            .entities
            .get(token)
            .map(|label| !label.is_empty())
            .unwrap_or(false)
    }

    pub fn idf(&self, token: &str) -> f64 {
        let s = self
            .tables
            .term_freq
            .get(token)
            .copied()
            .unwrap_or(self.config.unseen_frequency) as f64;
        let n = self.config.corpus_size;
        (10.0 + (n - s + 0.5) / (s + 0.5)).log10()
    }

    /// Weighted terms for a token batch, normalized to sum to one.
    ///
    /// A batch whose raw weights sum to zero comes back unnormalized.
    pub fn weights<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<(String, f64)> {
        let mut weighted = Vec::new();
        for token in tokens {
            let terms = merge_short_tokens(self.pretoken(token.as_ref(), true, true));
            for term in terms {
                let boost = if self.is_entity(&term) {
                    self.config.entity_boost
                } else {
                    1.0
                };
                let weight = self.idf(&term) * boost;
                weighted.push((term, weight));
            }
        }
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if total == 0.0 {
            return weighted;
        }
        weighted
            .into_iter()
            .map(|(term, weight)| (term, weight / total))
            .collect()
    }

    pub fn vector<S: AsRef<str>>(&self, tokens: &[S], dim: usize) -> TermVector {
        TermVector::from_weights(self.weights(tokens).into_iter().map(|(_, w)| w), dim)
    }
}

/// Joins a one-character token onto a longer token that follows it.
/// Single left-to-right pass.
pub fn merge_short_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut merged = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token.chars().count() == 1 {
            if let Some(next) = iter.peek() {
                if next.chars().count() > 1 {
                    let next = iter.next().unwrap_or_default();
                    merged.push(token + &next);
                    continue;
                }
            }
        }
        merged.push(token);
    }
    merged
}

fn is_single_digit(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_digit())
}
