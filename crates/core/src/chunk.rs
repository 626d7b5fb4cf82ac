use serde::{Deserialize, Serialize};

use crate::tags::strip_tags;

const SENTENCE_DELIMITERS: [char; 6] = ['!', '?', '。', '；', '！', '？'];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Upper bound on tag-free characters per chunk.
    pub chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { chunk_size: 128 }
    }
}

/// Packs sentences of tagged text into bounded chunks.
///
/// Splits only happen right after a sentence delimiter, and tags never
/// contain one, so every tag lands whole in exactly one chunk.
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn chunk_lines(&self, lines: &[String]) -> Vec<String> {
        self.chunk(&lines.join("\n"))
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let limit = self.config.chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut buffer = String::new();
        let mut buffer_len = 0usize;
        for section in split_sections(text) {
            let section_len = visible_len(section);
            if buffer_len + section_len < limit {
                buffer.push_str(section);
                buffer_len += section_len;
            } else {
                push_chunk(&mut chunks, std::mem::take(&mut buffer));
                buffer.push_str(section);
                buffer_len = section_len;
            }
        }
        push_chunk(&mut chunks, buffer);
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkConfig::default())
    }
}

fn split_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        if SENTENCE_DELIMITERS.contains(&ch) {
            let end = idx + ch.len_utf8();
            sections.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        sections.push(&text[start..]);
    }
    sections
}

fn visible_len(section: &str) -> usize {
    strip_tags(section).chars().count()
}

fn push_chunk(chunks: &mut Vec<String>, chunk: String) {
    if !chunk.trim().is_empty() {
        chunks.push(chunk);
    }
}
