//! Weighted reciprocal rank fusion of the lexical and vector lists.
//!
//! RRF contribution is `weight * 1/(rank + k)` plus a small bonus for a
//! list's top entry. Scores are normalised so the best fused result is
//! 1.0, then a floor prunes the tail.

use std::collections::HashMap;

use super::{SearchHit, SOURCE_HYBRID};

#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// How deep into each list contributions are taken from.
    pub candidate_limit: usize,
    /// Weight multiplier for the first (lexical) list.
    pub first_list_weight: f64,
    /// Added to a list's rank-0 entry.
    pub top_rank_bonus: f64,
    /// Normalised scores below this are dropped.
    pub min_score: f64,
    /// The standard RRF smoothing constant.
    pub rrf_k: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 30,
            first_list_weight: 2.0,
            top_rank_bonus: 0.05,
            min_score: 0.25,
            rrf_k: 60.0,
        }
    }
}

struct Accumulated {
    hit: SearchHit,
    score: f64,
    in_first: bool,
    in_second: bool,
}

/// Fuse two ranked lists. The lexical list is always first and carries
/// `first_list_weight`; the vector list carries weight 1. Ids present in
/// both lists sum their contributions and are tagged `hybrid`.
pub fn reciprocal_rank_fusion(
    lexical: &[SearchHit],
    vector: &[SearchHit],
    config: &FusionConfig,
) -> Vec<SearchHit> {
    let mut accumulated: HashMap<String, Accumulated> = HashMap::new();

    let mut contribute = |list: &[SearchHit], weight: f64, first_list: bool| {
        for (rank, hit) in list.iter().take(config.candidate_limit).enumerate() {
            let mut contribution = weight / (rank as f64 + config.rrf_k);
            if rank == 0 {
                contribution += config.top_rank_bonus;
            }
            let entry = accumulated
                .entry(hit.id.clone())
                .or_insert_with(|| Accumulated {
                    hit: hit.clone(),
                    score: 0.0,
                    in_first: false,
                    in_second: false,
                });
            entry.score += contribution;
            if first_list {
                entry.in_first = true;
            } else {
                entry.in_second = true;
            }
        }
    };
    contribute(lexical, config.first_list_weight, true);
    contribute(vector, 1.0, false);

    let max_score = accumulated
        .values()
        .map(|a| a.score)
        .fold(0.0f64, f64::max);

    let mut fused: Vec<SearchHit> = accumulated
        .into_values()
        .filter_map(|mut entry| {
            let normalised = if max_score > 0.0 {
                entry.score / max_score
            } else {
                0.0
            };
            if normalised < config.min_score {
                return None;
            }
            entry.hit.score = normalised;
            if entry.in_first && entry.in_second {
                entry.hit.source = SOURCE_HYBRID.to_string();
            }
            Some(entry.hit)
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}
