use std::collections::HashSet;
use std::sync::Arc;

use policy_rag_core::tags::{leading_tag_source, strip_leading_tag, TAG_CLOSE};
use policy_rag_core::{strip_tags, Tokenizer};
use serde::{Deserialize, Serialize};

const SENTENCE_ENDINGS: [char; 3] = ['。', '！', '？'];

/// A run of sentences around one that shares tokens with the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSpan {
    pub text: String,
    /// Share of query tokens found in the matching sentence.
    pub ratio: f64,
}

/// Picks the sentences of a chunk that talk about the query.
pub struct SentenceExtractor {
    tokenizer: Arc<dyn Tokenizer>,
    context_window: usize,
}

impl SentenceExtractor {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, context_window: usize) -> Self {
        Self {
            tokenizer,
            context_window,
        }
    }

    pub fn extract(&self, chunk: &str, next_chunk: Option<&str>, query: &str) -> Vec<ExtractedSpan> {
        let query_tokens = self.tokenizer.token_set(query);
        self.extract_with_tokens(chunk, next_chunk, &query_tokens)
    }

    /// Candidate spans, best ratio first; equal ratios keep sentence order.
    pub fn extract_with_tokens(
        &self,
        chunk: &str,
        next_chunk: Option<&str>,
        query_tokens: &HashSet<String>,
    ) -> Vec<ExtractedSpan> {
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let body = repair_trailing_tag(strip_leading_tag(chunk), next_chunk);
        let sentences = split_sentences(&body);

        let mut spans = Vec::new();
        for (idx, sentence) in sentences.iter().enumerate() {
            let tokens = self.tokenizer.token_set(&strip_tags(sentence));
            let hits = query_tokens.intersection(&tokens).count();
            if hits == 0 {
                continue;
            }
            let start = idx.saturating_sub(self.context_window + 1);
            let end = (idx + self.context_window + 2).min(sentences.len());
            spans.push(ExtractedSpan {
                text: sentences[start..end].join(" "),
                ratio: hits as f64 / query_tokens.len() as f64,
            });
        }
        spans.sort_by(|a, b| b.ratio.partial_cmp(&a.ratio).unwrap_or(std::cmp::Ordering::Equal));
        spans
    }
}

/// Appends the next chunk's leading tag when this chunk lost its own to a split.
fn repair_trailing_tag(chunk: &str, next_chunk: Option<&str>) -> String {
    let mut body = chunk.to_string();
    if chunk.trim_end().ends_with(TAG_CLOSE) {
        return body;
    }
    if let Some(tag) = next_chunk.and_then(leading_tag_source) {
        body.push(' ');
        body.push_str(tag);
    }
    body
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if SENTENCE_ENDINGS.contains(&ch) {
            let end = idx + ch.len_utf8();
            sentences.push(text[start..end].trim());
            start = end;
        }
    }
    sentences.push(text[start..].trim());
    sentences.retain(|s| !s.is_empty());
    sentences
}
