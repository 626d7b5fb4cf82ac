use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::{PolicyError, Result};

/// Text lines (each may carry position tags) and table extracts of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    pub lines: Vec<String>,
    pub tables: Vec<Value>,
}

pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedDocument>;
}

/// Plain UTF-8 text whose lines already carry their position tags, as
/// written by an upstream layout/OCR step.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedTextParser;

impl DocumentParser for TaggedTextParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let raw = fs::read_to_string(path)?;
        let lines = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(ParsedDocument {
            lines,
            tables: Vec::new(),
        })
    }
}

/// Lower-case file extension → parser.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Box<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("txt", TaggedTextParser);
        registry
    }

    pub fn register<P: DocumentParser + 'static>(&mut self, extension: &str, parser: P) {
        self.parsers
            .insert(extension.trim_start_matches('.').to_lowercase(), Box::new(parser));
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.parser_for(path).is_some()
    }

    pub fn parser_for(&self, path: &Path) -> Option<&dyn DocumentParser> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.parsers.get(&ext).map(|p| p.as_ref())
    }

    pub fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let parser = self
            .parser_for(path)
            .ok_or_else(|| PolicyError::UnsupportedInput(path.to_path_buf()))?;
        let parsed = parser.parse(path)?;
        debug!(
            path = %path.display(),
            lines = parsed.lines.len(),
            tables = parsed.tables.len(),
            "document parsed"
        );
        Ok(parsed)
    }
}
