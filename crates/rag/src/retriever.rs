use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use policy_rag_core::{ChunkRef, ChunkStore, TermWeighter, Tokenizer};
use policy_rag_index::{FlatL2Index, LexicalScorer, Okapi, VectorIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::extract::SentenceExtractor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevantSpan {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub document_name: String,
    pub chunk_index: usize,
    pub hybrid_score: f64,
    pub relevant_spans: Vec<RelevantSpan>,
}

impl SearchResult {
    pub fn new(document_name: &str, chunk_index: usize, hybrid_score: f64, span: &str) -> Self {
        Self {
            document_name: document_name.to_string(),
            chunk_index,
            hybrid_score,
            relevant_spans: vec![RelevantSpan {
                text: span.to_string(),
                score: hybrid_score,
            }],
        }
    }
}

/// Per-chunk signals before blending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkScores {
    pub lexical: f64,
    pub vector: f64,
    pub keyword: f64,
    pub hybrid: f64,
}

/// Ranks every chunk of the store with BM25, term-vector proximity and
/// keyword overlap.
///
/// `search` takes `&self`: the nearest-neighbour index is built inside the
/// call and dropped with it, so one retriever can serve concurrent queries.
pub struct HybridRetriever {
    store: ChunkStore,
    tokenizer: Arc<dyn Tokenizer>,
    weighter: TermWeighter,
    lexical: Box<dyn LexicalScorer + Send + Sync>,
    extractor: SentenceExtractor,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: ChunkStore,
        tokenizer: Arc<dyn Tokenizer>,
        weighter: TermWeighter,
        config: RetrievalConfig,
    ) -> Self {
        let extractor = SentenceExtractor::new(Arc::clone(&tokenizer), config.context_window);
        Self {
            store,
            tokenizer,
            weighter,
            lexical: Box::new(Okapi::default()),
            extractor,
            config,
        }
    }

    pub fn with_lexical_scorer<S: LexicalScorer + Send + Sync + 'static>(mut self, scorer: S) -> Self {
        self.lexical = Box::new(scorer);
        self
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Query tokens, de-duplicated in first-seen order.
    pub fn query_tokens(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tokenizer
            .tokens(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    /// Component and blended scores for every chunk, in store order.
    pub fn score_chunks(&self, query: &str, top_k: usize) -> Vec<ChunkScores> {
        let chunks = self.store.all_chunks();
        self.score_candidates(&chunks, &self.query_tokens(query), top_k)
    }

    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchResult> {
        let chunks = self.store.all_chunks();
        if chunks.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let query_tokens = self.query_tokens(query);
        let scores = self.score_candidates(&chunks, &query_tokens, top_k);

        let mut order: Vec<usize> = (0..chunks.len()).collect();
        order.sort_by(|a, b| {
            scores[*b]
                .hybrid
                .partial_cmp(&scores[*a].hybrid)
                .unwrap_or(Ordering::Equal)
        });
        order.truncate(top_k);

        let query_set: HashSet<String> = query_tokens.into_iter().collect();
        let results: Vec<SearchResult> = order
            .into_iter()
            .map(|idx| {
                let chunk = &chunks[idx];
                let next = chunks
                    .get(idx + 1)
                    .filter(|n| n.document_name == chunk.document_name)
                    .map(|n| n.text);
                let spans = self.extractor.extract_with_tokens(chunk.text, next, &query_set);
                let best = spans
                    .into_iter()
                    .next()
                    .map(|span| span.text)
                    .unwrap_or_else(|| chunk.text.to_string());
                SearchResult::new(chunk.document_name, chunk.chunk_index, scores[idx].hybrid, &best)
            })
            .collect();
        info!(query, results = results.len(), candidates = chunks.len(), "search finished");
        results
    }

    fn score_candidates(&self, chunks: &[ChunkRef<'_>], query_tokens: &[String], top_k: usize) -> Vec<ChunkScores> {
        let corpus: Vec<Vec<String>> = chunks
            .iter()
            .map(|c| self.tokenizer.tokens(&ChunkStore::clean_text(c.text)))
            .collect();

        let lexical = self.lexical.score(&corpus, query_tokens);
        let vector = self.vector_scores(&corpus, query_tokens, top_k);
        let query_set: HashSet<&str> = query_tokens.iter().map(String::as_str).collect();

        corpus
            .iter()
            .enumerate()
            .map(|(idx, tokens)| {
                let chunk_set: HashSet<&str> = tokens.iter().map(String::as_str).collect();
                let lexical = lexical.get(idx).copied().unwrap_or(0.0);
                let vector = vector[idx];
                let keyword = keyword_match_score(&query_set, &chunk_set);
                ChunkScores {
                    lexical,
                    vector,
                    keyword,
                    hybrid: self.config.weights.combine(lexical, vector, keyword),
                }
            })
            .collect()
    }

    /// `1 / (rank + 1)` for the `top_k` nearest chunk vectors, zero elsewhere.
    fn vector_scores(&self, corpus: &[Vec<String>], query_tokens: &[String], top_k: usize) -> Vec<f64> {
        let dim = self.config.dim;
        let mut scores = vec![0.0; corpus.len()];
        let vectors: Vec<Vec<f32>> = corpus
            .iter()
            .map(|tokens| self.weighter.vector(tokens, dim).into_inner())
            .collect();
        let query = self.weighter.vector(query_tokens, dim);

        let mut index = FlatL2Index::new(dim);
        let neighbours = index
            .add(&vectors)
            .and_then(|_| index.search(query.as_slice(), top_k));
        match neighbours {
            Ok(neighbours) => {
                for (rank, hit) in neighbours.iter().enumerate() {
                    if let Some(slot) = scores.get_mut(hit.id) {
                        *slot = 1.0 / (rank as f64 + 1.0);
                    }
                }
            }
            Err(err) => warn!("vector scoring skipped: {err}"),
        }
        debug!(vectors = index.len(), dim, "term-vector index built");
        scores
    }
}

/// Overlap between query and chunk tokens, normalized by query size.
///
/// Every two-character query token contained in a four-character chunk
/// token adds one more hit, so the score can exceed 1.
pub fn keyword_match_score(query_tokens: &HashSet<&str>, chunk_tokens: &HashSet<&str>) -> f64 {
    let mut hits = query_tokens.intersection(chunk_tokens).count();
    for query in query_tokens.iter().filter(|q| q.chars().count() == 2) {
        hits += chunk_tokens
            .iter()
            .filter(|word| word.chars().count() == 4 && word.contains(*query))
            .count();
    }
    hits as f64 / query_tokens.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_rag_core::{DictionaryTokenizer, DocumentEntry, Snapshot, TermTables, TermWeighterConfig};

    fn retriever(docs: &[(&str, &[&str])], vocabulary: &[&str]) -> HybridRetriever {
        let mut snapshot = Snapshot::new();
        for (name, chunks) in docs {
            snapshot.insert(
                name.to_string(),
                DocumentEntry {
                    text_chunks: chunks.iter().map(|c| c.to_string()).collect(),
                    ..Default::default()
                },
            );
        }
        let tokenizer: Arc<dyn Tokenizer> =
            Arc::new(DictionaryTokenizer::with_vocabulary(vocabulary.iter().copied()));
        let weighter = TermWeighter::new(
            Arc::clone(&tokenizer),
            TermTables::default(),
            TermWeighterConfig::default(),
        );
        HybridRetriever::new(
            ChunkStore::from_snapshot(snapshot),
            tokenizer,
            weighter,
            RetrievalConfig::default(),
        )
    }

    fn set<'a>(items: &[&'a str]) -> HashSet<&'a str> {
        items.iter().copied().collect()
    }

    #[test]
    fn keyword_score_counts_bonus_for_four_character_words() {
        let q = set(&["推免", "资格"]);
        let t = set(&["推免资格", "条件"]);
        assert_eq!(keyword_match_score(&q, &t), 1.0);
        let t = set(&["推免", "推免资格"]);
        assert_eq!(keyword_match_score(&q, &t), 1.5);
        assert_eq!(keyword_match_score(&set(&[]), &t), 0.0);
    }

    #[test]
    fn empty_corpus_returns_nothing() {
        let r = retriever(&[], &[]);
        assert!(r.search("推免资格", 5).is_empty());
    }

    #[test]
    fn single_tagged_chunk_is_found() {
        let chunk = "推免资格需满足条件@@3\t10.0\t20.0\t50.0\t30.0##";
        let r = retriever(&[("细则.pdf", &[chunk])], &["推免", "资格", "条件"]);
        let results = r.search("推免资格", 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_name, "细则.pdf");
        assert!(results[0].hybrid_score > 0.0);
        assert!(results[0].relevant_spans[0].text.contains("推免资格需满足条件"));
        assert_eq!(results[0].relevant_spans[0].score, results[0].hybrid_score);
    }

    #[test]
    fn ranks_matching_chunk_first_and_respects_top_k() {
        let r = retriever(
            &[
                ("a.pdf", &["奖学金评定办法。", "学分认定规则。"]),
                ("b.pdf", &["推免资格需满足条件。", "论文格式要求。"]),
            ],
            &["推免", "资格", "学分", "论文", "奖学金"],
        );
        let results = r.search("推免资格", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_name, "b.pdf");
        assert_eq!(results[0].chunk_index, 0);
        assert!(results[0].hybrid_score >= results[1].hybrid_score);
    }

    #[test]
    fn unmatched_query_falls_back_to_chunk_text() {
        let r = retriever(&[("a.pdf", &["奖学金评定办法。"])], &["奖学金"]);
        let results = r.search("宿舍", 1);
        assert_eq!(results[0].relevant_spans[0].text, "奖学金评定办法。");
    }

    #[test]
    fn ties_keep_store_order() {
        let r = retriever(&[("a.pdf", &["甲。", "乙。", "丙。"])], &[]);
        let results = r.search("无关", 3);
        let order: Vec<usize> = results.iter().map(|r| r.chunk_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn borrowed_tag_stays_within_document() {
        let r = retriever(
            &[
                ("a.pdf", &["学分认定。"]),
                ("b.pdf", &["@@1\t1.0\t2.0\t3.0\t4.0##其他内容。"]),
            ],
            &["学分"],
        );
        let results = r.search("学分", 1);
        assert_eq!(results[0].relevant_spans[0].text, "学分认定。");
    }
}
