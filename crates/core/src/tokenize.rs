use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{info, warn};
use unicode_segmentation::UnicodeSegmentation;

/// Turns text into whitespace-separated tokens.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> String;

    fn tokens(&self, text: &str) -> Vec<String> {
        self.tokenize(text)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    fn token_set(&self, text: &str) -> HashSet<String> {
        self.tokens(text).into_iter().collect()
    }
}

/// Forward-maximum-matching segmenter for Han text, word boundaries elsewhere.
///
/// Han runs are matched greedily against the vocabulary; anything the
/// vocabulary does not cover falls back to single characters.
#[derive(Debug, Clone, Default)]
pub struct DictionaryTokenizer {
    vocabulary: HashSet<String>,
    max_word_chars: usize,
}

impl DictionaryTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vocabulary<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokenizer = Self::new();
        tokenizer.extend(words);
        tokenizer
    }

    pub fn extend<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for word in words {
            let word: String = word.into().trim().to_lowercase();
            let chars = word.chars().count();
            if chars < 2 {
                continue;
            }
            self.max_word_chars = self.max_word_chars.max(chars);
            self.vocabulary.insert(word);
        }
    }

    /// Reads a user dictionary: one entry per line, the word in the first
    /// whitespace-separated field. Unreadable files leave the vocabulary as is.
    pub fn load_dictionary<P: AsRef<Path>>(&mut self, path: P) -> usize {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => {
                let before = self.vocabulary.len();
                self.extend(raw.lines().filter_map(|l| l.split_whitespace().next()));
                let added = self.vocabulary.len() - before;
                info!(path = %path.display(), added, "tokenizer dictionary loaded");
                added
            }
            Err(err) => {
                warn!(path = %path.display(), "tokenizer dictionary not loaded: {err}");
                0
            }
        }
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    fn segment_han(&self, run: &[char], out: &mut Vec<String>) {
        let mut idx = 0usize;
        while idx < run.len() {
            let longest = self.max_word_chars.min(run.len() - idx);
            let mut matched = 1usize;
            for len in (2..=longest).rev() {
                let candidate: String = run[idx..idx + len].iter().collect();
                if self.vocabulary.contains(&candidate) {
                    matched = len;
                    break;
                }
            }
            out.push(run[idx..idx + matched].iter().collect());
            idx += matched;
        }
    }
}

impl Tokenizer for DictionaryTokenizer {
    fn tokenize(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let mut tokens = Vec::new();
        let mut han_run: Vec<char> = Vec::new();
        let mut other_run = String::new();
        for ch in lowered.chars() {
            if is_han(ch) {
                if !other_run.is_empty() {
                    tokens.extend(other_run.unicode_words().map(str::to_string));
                    other_run.clear();
                }
                han_run.push(ch);
            } else {
                if !han_run.is_empty() {
                    self.segment_han(&han_run, &mut tokens);
                    han_run.clear();
                }
                other_run.push(ch);
            }
        }
        if !han_run.is_empty() {
            self.segment_han(&han_run, &mut tokens);
        }
        if !other_run.is_empty() {
            tokens.extend(other_run.unicode_words().map(str::to_string));
        }
        tokens.join(" ")
    }
}

pub fn is_han(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2A6DF}')
}
