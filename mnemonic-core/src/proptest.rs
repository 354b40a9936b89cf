//! Property-based tests for ranking, identity and tiering invariants.
//!
//! - Cosine similarity stays within [-1, 1] and is symmetric
//! - Warm search results are filtered, ordered and bounded
//! - Record ids are a pure function of content
//! - Promotion fires exactly at the access threshold

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::embedding::HashEmbedder;
    use crate::memory::{truncate_chars, MemoryId, Tier};
    use crate::tiering::{AccessPattern, TierManager, TierPolicy};
    use crate::warm::{cosine_similarity, WarmIndex};

    const DIM: usize = 4;

    fn vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0f32, dim)
    }

    fn non_zero_vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        vector(dim).prop_filter("non-zero", |v| v.iter().any(|x| x.abs() > 1e-3))
    }

    // =========================================================================
    // Similarity
    // =========================================================================

    proptest! {
        #[test]
        fn cosine_is_bounded(a in vector(8), b in vector(8)) {
            let sim = cosine_similarity(&a, &b);
            prop_assert!((-1.0001..=1.0001).contains(&sim), "similarity {} out of range", sim);
        }

        #[test]
        fn cosine_is_symmetric(a in vector(8), b in vector(8)) {
            let ab = cosine_similarity(&a, &b);
            let ba = cosine_similarity(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-5);
        }

        #[test]
        fn cosine_of_vector_with_itself_is_one(a in non_zero_vector(8)) {
            prop_assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-4);
        }

        #[test]
        fn hash_embeddings_are_unit_length(text in ".{0,64}", dim in 1usize..300) {
            let vector = HashEmbedder::new(dim).embed_sync(&text);
            let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assert_eq!(vector.len(), dim);
            prop_assert!((norm - 1.0).abs() < 1e-3);
        }
    }

    // =========================================================================
    // Warm search
    // =========================================================================

    proptest! {
        #[test]
        fn search_is_filtered_sorted_and_bounded(
            stored in prop::collection::vec(non_zero_vector(DIM), 0..30),
            query in non_zero_vector(DIM),
            k in 0usize..10,
            threshold in -1.0f32..1.0f32,
        ) {
            let mut index = WarmIndex::new(DIM, 100);
            for (i, v) in stored.iter().enumerate() {
                let id = MemoryId::from_content(&format!("m{}", i));
                index.insert(&id, v.clone(), "p").unwrap();
            }

            let results = index.search(&query, k, threshold);
            prop_assert!(results.len() <= k);
            prop_assert!(results.len() <= stored.len());
            for pair in results.windows(2) {
                prop_assert!(pair[0].similarity >= pair[1].similarity);
            }
            for found in &results {
                prop_assert!(found.similarity >= threshold);
            }
        }

        #[test]
        fn index_never_exceeds_limit(
            stored in prop::collection::vec(non_zero_vector(DIM), 0..40),
            limit in 1usize..10,
        ) {
            let mut index = WarmIndex::new(DIM, limit);
            for (i, v) in stored.iter().enumerate() {
                let id = MemoryId::from_content(&format!("m{}", i));
                index.insert(&id, v.clone(), "p").unwrap();
                prop_assert!(index.len() <= limit);
            }
        }
    }

    // =========================================================================
    // Identity and text
    // =========================================================================

    proptest! {
        #[test]
        fn ids_are_deterministic(content in ".*") {
            prop_assert_eq!(MemoryId::from_content(&content), MemoryId::from_content(&content));
        }

        #[test]
        fn distinct_content_has_distinct_ids(a in ".{0,32}", b in ".{0,32}") {
            prop_assume!(a != b);
            prop_assert_ne!(MemoryId::from_content(&a), MemoryId::from_content(&b));
        }

        #[test]
        fn truncation_respects_char_budget(text in ".{0,100}", max in 0usize..50) {
            let cut = truncate_chars(&text, max);
            prop_assert!(cut.chars().count() <= max);
            prop_assert!(text.starts_with(&cut));
        }
    }

    // =========================================================================
    // Tiering
    // =========================================================================

    proptest! {
        #[test]
        fn cold_promotes_exactly_at_threshold(threshold in 1u64..20, accesses in 0u64..50) {
            let mut tiers = TierManager::new(TierPolicy {
                promotion_threshold: threshold,
                ..TierPolicy::default()
            });
            let id = MemoryId::from_content("record");
            tiers.track(id.clone(), AccessPattern::new(Tier::Cold));
            for _ in 0..accesses {
                tiers.record_access(&id);
            }

            let expected = (accesses >= threshold).then_some(Tier::Warm);
            prop_assert_eq!(tiers.should_promote(&id), expected);
        }

        #[test]
        fn warm_promotes_at_double_threshold(threshold in 1u64..20, accesses in 0u64..50) {
            let mut tiers = TierManager::new(TierPolicy {
                promotion_threshold: threshold,
                ..TierPolicy::default()
            });
            let id = MemoryId::from_content("record");
            tiers.track(id.clone(), AccessPattern::new(Tier::Warm));
            for _ in 0..accesses {
                tiers.record_access(&id);
            }

            let expected = (accesses >= 2 * threshold).then_some(Tier::Hot);
            prop_assert_eq!(tiers.should_promote(&id), expected);
        }
    }
}
