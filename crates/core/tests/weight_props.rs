use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use policy_rag_core::{DictionaryTokenizer, TermTables, TermWeighter, TermWeighterConfig, Tokenizer};

const WORDS: [&str; 6] = ["学分", "论文", "推免", "资格", "条件", "导师"];

fn weighter(term_freq: HashMap<String, u64>, entities: HashMap<String, String>) -> TermWeighter {
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(DictionaryTokenizer::with_vocabulary(WORDS));
    TermWeighter::new(
        tokenizer,
        TermTables {
            term_freq,
            entities,
        },
        TermWeighterConfig::default(),
    )
}

fn term_freq() -> impl Strategy<Value = HashMap<String, u64>> {
    prop::collection::hash_map(prop::sample::select(WORDS.to_vec()), 0u64..=1_000_000, 0..6)
        .prop_map(|table| table.into_iter().map(|(w, f)| (w.to_string(), f)).collect())
}

fn entities() -> impl Strategy<Value = HashMap<String, String>> {
    prop::collection::hash_set(prop::sample::select(WORDS.to_vec()), 0..3)
        .prop_map(|words| words.into_iter().map(|w| (w.to_string(), "ORG".to_string())).collect())
}

fn tokens() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::collection::vec(prop::sample::select(WORDS.to_vec()), 1..4).prop_map(|w| w.concat()),
        0..6,
    )
}

proptest! {
    #[test]
    fn term_weights_sum_to_one(
        term_freq in term_freq(),
        entities in entities(),
        tokens in tokens(),
        dim in 1usize..16,
    ) {
        let weighter = weighter(term_freq, entities);
        let weights = weighter.weights(&tokens);
        prop_assert_eq!(weights.is_empty(), tokens.is_empty());

        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if !weights.is_empty() {
            prop_assert!((total - 1.0).abs() < 1e-9, "sum {}", total);
        }
        for (term, weight) in &weights {
            prop_assert!(*weight > 0.0 && *weight <= 1.0, "{} -> {}", term, weight);
        }

        let vector = weighter.vector(&tokens, dim);
        prop_assert_eq!(vector.len(), dim);
        for (value, (_, weight)) in vector.as_slice().iter().zip(&weights) {
            prop_assert!((*value as f64 - weight).abs() < 1e-6);
        }
    }
}
