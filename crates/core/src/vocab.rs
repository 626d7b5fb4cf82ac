use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::store::ChunkStore;
use crate::tags::strip_tags;
use crate::tokenize::{is_han, Tokenizer};

/// Counts term occurrences over chunk text to build a `term.freq` table.
///
/// Tokens of one character are never counted. With `with_ngrams(n)` every
/// Han substring of 2..=n characters is counted as well, which gives the
/// tokenizer a vocabulary to start from when no dictionary exists yet.
pub struct TermCounter {
    tokenizer: Arc<dyn Tokenizer>,
    max_ngram: usize,
    counts: HashMap<String, u64>,
}

impl TermCounter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            max_ngram: 0,
            counts: HashMap::new(),
        }
    }

    /// `0` or `1` turns n-gram counting off.
    pub fn with_ngrams(mut self, max_ngram: usize) -> Self {
        self.max_ngram = max_ngram;
        self
    }

    pub fn add_text(&mut self, text: &str) {
        let clean = strip_tags(text);
        for token in self.tokenizer.tokens(&clean) {
            let chars = token.chars().count();
            if chars < 2 {
                continue;
            }
            // Short Han tokens are already covered by the n-gram pass.
            if self.max_ngram >= 2 && chars <= self.max_ngram && token.chars().all(is_han) {
                continue;
            }
            *self.counts.entry(token).or_insert(0) += 1;
        }
        if self.max_ngram >= 2 {
            self.count_ngrams(&clean);
        }
    }

    /// Feeds every chunk of the store. Returns the number of chunks read.
    pub fn add_store(&mut self, store: &ChunkStore) -> usize {
        let chunks = store.all_chunks();
        for chunk in &chunks {
            self.add_text(chunk.text);
        }
        debug!(chunks = chunks.len(), terms = self.counts.len(), "chunks counted");
        chunks.len()
    }

    fn count_ngrams(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        for run in chars.split(|ch| !is_han(*ch)) {
            for start in 0..run.len() {
                let longest = self.max_ngram.min(run.len() - start);
                for len in 2..=longest {
                    let gram: String = run[start..start + len].iter().collect();
                    *self.counts.entry(gram).or_insert(0) += 1;
                }
            }
        }
    }

    /// Terms seen at least `min_freq` times, most frequent first, ties by term.
    pub fn terms(&self, min_freq: u64) -> Vec<(String, u64)> {
        let mut terms: Vec<(String, u64)> = self
            .counts
            .iter()
            .filter(|(_, freq)| **freq >= min_freq)
            .map(|(term, freq)| (term.clone(), *freq))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        terms
    }

    /// Writes `term<TAB>freq` lines through a temp file next to `path`.
    pub fn write<P: AsRef<Path>>(&self, path: P, min_freq: u64) -> Result<usize> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let terms = self.terms(min_freq);
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        for (term, freq) in &terms {
            writeln!(temp, "{term}\t{freq}")?;
        }
        temp.flush()?;
        temp.persist(path).map_err(|e| e.error)?;
        info!(path = %path.display(), terms = terms.len(), min_freq, "term frequencies written");
        Ok(terms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentEntry;
    use crate::tags::PositionTag;
    use crate::tokenize::DictionaryTokenizer;
    use crate::weight::parse_term_freq;

    fn tokenizer(words: &[&str]) -> Arc<dyn Tokenizer> {
        Arc::new(DictionaryTokenizer::with_vocabulary(words.iter().copied()))
    }

    #[test]
    fn counts_tokens_without_tags_or_single_chars() {
        let mut counter = TermCounter::new(tokenizer(&["推免", "资格"]));
        let tag = PositionTag::new(1, 10.0, 20.0, 30.0, 40.0);
        counter.add_text(&format!("推免资格。{tag}"));
        counter.add_text("推免的GPA要求");
        let terms = counter.terms(1);
        assert_eq!(
            terms,
            vec![
                ("推免".to_string(), 2),
                ("gpa".to_string(), 1),
                ("资格".to_string(), 1),
            ]
        );
        assert_eq!(counter.terms(2), vec![("推免".to_string(), 2)]);
    }

    #[test]
    fn ngrams_bootstrap_an_empty_vocabulary() {
        let mut counter = TermCounter::new(tokenizer(&[])).with_ngrams(3);
        counter.add_text("学分认定，学分");
        let terms: HashMap<String, u64> = counter.terms(1).into_iter().collect();
        assert_eq!(terms["学分"], 2);
        assert_eq!(terms["学分认"], 1);
        assert_eq!(terms["认定"], 1);
        assert!(!terms.contains_key("定，"));
        assert!(!terms.contains_key("学分认定"));
    }

    #[test]
    fn ngram_mode_does_not_double_count_dictionary_words() {
        let mut counter = TermCounter::new(tokenizer(&["学分"])).with_ngrams(2);
        counter.add_text("学分");
        assert_eq!(counter.terms(1), vec![("学分".to_string(), 1)]);
    }

    #[test]
    fn writes_a_table_the_weighter_can_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::empty();
        store.insert(
            "政策",
            DocumentEntry {
                text_chunks: vec!["推免资格。推免名额。".to_string(), "资格审查。".to_string()],
                ..DocumentEntry::default()
            },
        );
        let mut counter = TermCounter::new(tokenizer(&["推免", "资格", "名额"]));
        assert_eq!(counter.add_store(&store), 2);

        let path = dir.path().join("res").join("term.freq");
        assert_eq!(counter.write(&path, 2).unwrap(), 2);
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "推免\t2\n资格\t2\n");
        let table = parse_term_freq(&raw);
        assert_eq!(table["推免"], 2);
        assert!(!table.contains_key("名额"));
    }
}
