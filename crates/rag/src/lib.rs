pub mod config;
pub mod error;
pub mod extract;
pub mod filter;
pub mod keywords;
pub mod localize;
pub mod pipeline;
pub mod raster;
pub mod retriever;
pub mod similarity;

pub use config::{HighlightConfig, KeywordConfig, RendererConfig, RetrievalConfig, ScoreWeights};
pub use error::{RagError, Result};
pub use extract::{ExtractedSpan, SentenceExtractor};
pub use filter::filter_results;
pub use keywords::{
    expand_query, local_keywords, parse_keyword_response, strip_think, KeywordExtractor,
    KeywordSource, Keywords, LlmKeywordSource, RetryPolicy,
};
pub use localize::{find_best_match, highlight_boxes, map_box, EvidenceLocalizer, EvidenceMatch, PixelBox};
pub use pipeline::{annotate_references, format_results, PolicyAnswer, PolicyQa};
pub use raster::{CommandRasterizer, PageRasterizer, PrerenderedPages};
pub use retriever::{keyword_match_score, ChunkScores, HybridRetriever, RelevantSpan, SearchResult};
pub use similarity::similarity_ratio;
pub use policy_rag_llm::{LlmClient, LlmProvider, LlmRequest, LlmResponse};
