//! Retrieval primitives the hybrid retriever consumes: a nearest-neighbour
//! vector index, a lexical scorer, and a JSONL sink for ranked output.

mod bm25;
mod flat;
mod jsonl;

pub use bm25::{LexicalScorer, Okapi, OkapiIndex};
pub use flat::{FlatL2Index, Neighbour, VectorIndex};
pub use jsonl::JsonlWriter;
