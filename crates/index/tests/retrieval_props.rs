use policy_rag_index::{FlatL2Index, LexicalScorer, Okapi, VectorIndex};
use proptest::prelude::*;

fn corpus() -> impl Strategy<Value = Vec<Vec<String>>> {
    prop::collection::vec(prop::collection::vec("[a-e]", 0..8), 0..12)
}

proptest! {
    #[test]
    fn one_score_per_document(docs in corpus(), query in prop::collection::vec("[a-g]", 0..5)) {
        let scores = Okapi::default().score(&docs, &query);
        prop_assert_eq!(scores.len(), docs.len());
        prop_assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn search_is_sorted_and_bounded(
        vectors in prop::collection::vec(prop::collection::vec(-10.0f32..10.0, 4), 0..20),
        query in prop::collection::vec(-10.0f32..10.0, 4),
        k in 0usize..25,
    ) {
        let mut index = FlatL2Index::new(4);
        index.add(&vectors).unwrap();
        let hits = index.search(&query, k).unwrap();
        prop_assert_eq!(hits.len(), k.min(vectors.len()));
        prop_assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
}
