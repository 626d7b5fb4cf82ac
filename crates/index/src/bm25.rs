use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scores every document of a tokenized corpus against a query.
pub trait LexicalScorer {
    fn score(&self, corpus: &[Vec<String>], query: &[String]) -> Vec<f64>;
}

/// Okapi BM25 parameters.
///
/// Terms whose idf comes out negative (present in more than half the
/// corpus) get `epsilon * mean_idf` instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Okapi {
    pub k1: f64,
    pub b: f64,
    pub epsilon: f64,
}

impl Default for Okapi {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

impl Okapi {
    pub fn index(&self, corpus: &[Vec<String>]) -> OkapiIndex {
        OkapiIndex::build(*self, corpus)
    }
}

impl LexicalScorer for Okapi {
    fn score(&self, corpus: &[Vec<String>], query: &[String]) -> Vec<f64> {
        self.index(corpus).scores(query)
    }
}

/// Term statistics for one corpus.
#[derive(Debug, Clone)]
pub struct OkapiIndex {
    params: Okapi,
    term_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl OkapiIndex {
    fn build(params: Okapi, corpus: &[Vec<String>]) -> Self {
        let mut term_freqs = Vec::with_capacity(corpus.len());
        let mut doc_lens = Vec::with_capacity(corpus.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_tokens = 0usize;
        for doc in corpus {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in doc {
                *freqs.entry(token.clone()).or_default() += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
            total_tokens += doc.len();
            doc_lens.push(doc.len());
            term_freqs.push(freqs);
        }

        let n = corpus.len() as f64;
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total_tokens as f64 / n
        };

        let mut idf = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (term, df) in doc_freq {
            let df = df as f64;
            let value = (n - df + 0.5).ln() - (df + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term, value);
        }
        if !idf.is_empty() {
            let floor = params.epsilon * idf_sum / idf.len() as f64;
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Self {
            params,
            term_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    pub fn idf(&self, term: &str) -> Option<f64> {
        self.idf.get(term).copied()
    }

    /// One score per document, in corpus order. Repeated query terms count
    /// once per occurrence.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let Okapi { k1, b, .. } = self.params;
        let mut scores = vec![0.0; self.len()];
        for term in query {
            let Some(idf) = self.idf(term) else {
                continue;
            };
            for (doc, score) in scores.iter_mut().enumerate() {
                let tf = self.term_freqs[doc].get(term).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let dl = self.doc_lens[doc] as f64;
                *score += idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / self.avgdl));
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(raw: &[&str]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|d| d.split_whitespace().map(str::to_string).collect())
            .collect()
    }

    fn query(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn rare_term_scores_its_document() {
        let corpus = docs(&["推免 资格 条件", "学分 认定 程序", "奖学金 评定 办法"]);
        let scores = Okapi::default().score(&corpus, &query("推免"));
        assert!(scores[0] > 0.0);
        assert_eq!(scores[1], 0.0);
        assert_eq!(scores[2], 0.0);

        // idf = ln(3 - 1 + 0.5) - ln(1 + 0.5); dl == avgdl here.
        let idf = (2.5f64).ln() - (1.5f64).ln();
        let expected = idf * 2.5 / (1.0 + 1.5);
        assert!((scores[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn common_terms_fall_back_to_epsilon_idf() {
        let corpus = docs(&["规定 学分", "规定 条件", "规定 办法"]);
        let index = Okapi::default().index(&corpus);
        let common = index.idf("规定").unwrap();
        let rare = index.idf("学分").unwrap();
        let raw_common = (0.5f64).ln() - (3.5f64).ln();
        let mean = (raw_common + 3.0 * rare) / 4.0;
        assert!((common - 0.25 * mean).abs() < 1e-12);
    }

    #[test]
    fn empty_corpus_scores_nothing() {
        assert!(Okapi::default().score(&[], &query("推免")).is_empty());
    }

    #[test]
    fn unknown_terms_and_empty_documents_score_zero() {
        let corpus = vec![Vec::new(), vec!["学分".to_string()]];
        let scores = Okapi::default().score(&corpus, &query("未知"));
        assert_eq!(scores, vec![0.0, 0.0]);
    }
}
