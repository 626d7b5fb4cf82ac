use std::fs;
use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chunk::Chunker;
use crate::error::Result;
use crate::tags::strip_tags;

/// One document in the corpus snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub text_chunks: Vec<String>,
    #[serde(default)]
    pub tables: Vec<Value>,
}

impl DocumentEntry {
    pub fn from_lines(name: &str, lines: &[String], tables: Vec<Value>, chunker: &Chunker) -> Self {
        Self {
            file_name: Some(name.to_string()),
            text_chunks: chunker.chunk_lines(lines),
            tables,
        }
    }
}

/// File name → document, in snapshot order.
pub type Snapshot = IndexMap<String, DocumentEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef<'a> {
    pub document_name: &'a str,
    pub chunk_index: usize,
    pub text: &'a str,
}

/// Read-mostly view over the corpus snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    documents: Snapshot,
}

impl ChunkStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_snapshot(documents: Snapshot) -> Self {
        Self { documents }
    }

    /// Loads a snapshot, degrading to an empty corpus when the file is
    /// missing or unreadable.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "corpus snapshot not found, starting empty");
            return Self::empty();
        }
        match Self::try_load(path) {
            Ok(store) => {
                info!(
                    documents = store.len(),
                    chunks = store.chunk_count(),
                    "corpus snapshot loaded"
                );
                store
            }
            Err(err) => {
                warn!(path = %path.display(), "corpus snapshot unreadable, starting empty: {err}");
                Self::empty()
            }
        }
    }

    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let documents: Snapshot = serde_json::from_str(&raw)?;
        Ok(Self { documents })
    }

    /// Writes the snapshot through a temp file in the target directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        let body = serde_json::to_string_pretty(&self.documents)?;
        temp.write_all(body.as_bytes())?;
        temp.flush()?;
        temp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), documents = self.len(), "corpus snapshot saved");
        Ok(())
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.documents.values().map(|d| d.text_chunks.len()).sum()
    }

    pub fn contains(&self, document_name: &str) -> bool {
        self.documents.contains_key(document_name)
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(|k| k.as_str())
    }

    pub fn tables(&self, document_name: &str) -> &[Value] {
        self.documents
            .get(document_name)
            .map(|d| d.tables.as_slice())
            .unwrap_or(&[])
    }

    /// Every chunk of every document, documents in snapshot order.
    pub fn all_chunks(&self) -> Vec<ChunkRef<'_>> {
        self.documents
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .text_chunks
                    .iter()
                    .enumerate()
                    .map(move |(chunk_index, text)| ChunkRef {
                        document_name: name.as_str(),
                        chunk_index,
                        text: text.as_str(),
                    })
            })
            .collect()
    }

    /// Chunk text without position tags, for indexing only.
    pub fn clean_text(chunk_text: &str) -> String {
        strip_tags(chunk_text)
    }

    /// Adds a document unless one with the same name is already present.
    pub fn insert(&mut self, document_name: impl Into<String>, entry: DocumentEntry) -> bool {
        let name = document_name.into();
        if self.documents.contains_key(&name) {
            debug!(document = %name, "document already in snapshot, skipping");
            return false;
        }
        self.documents.insert(name, entry);
        true
    }

    /// Merges new documents in, keeping existing ones. Returns how many were added.
    pub fn merge(&mut self, other: Snapshot) -> usize {
        let mut added = 0usize;
        for (name, entry) in other {
            if self.insert(name, entry) {
                added += 1;
            }
        }
        added
    }
}
