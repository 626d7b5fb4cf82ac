mod chunk;
mod error;
mod geometry;
mod parser;
mod store;
pub mod tags;
mod tokenize;
mod vocab;
mod weight;

pub use chunk::{ChunkConfig, Chunker};
pub use error::{PolicyError, Result};
pub use geometry::{FixedGeometry, PageGeometry, PdfGeometry};
pub use parser::{DocumentParser, ParsedDocument, ParserRegistry, TaggedTextParser};
pub use store::{ChunkRef, ChunkStore, DocumentEntry, Snapshot};
pub use tags::{parse_tags, strip_tags, PositionTag, TaggedText};
pub use tokenize::{is_han, DictionaryTokenizer, Tokenizer};
pub use vocab::TermCounter;
pub use weight::{
    merge_short_tokens, parse_term_freq, TermTables, TermVector, TermWeighter, TermWeighterConfig,
    DEFAULT_DIM,
};
