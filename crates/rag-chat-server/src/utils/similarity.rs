//! Embedding-space scoring. Retrieval relevance, the gating centroid test,
//! and MMR redundancy all reduce to the same cosine primitive, so it lives
//! here once and every caller speaks in similarity (not distance).

use anyhow::Result;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in [-1, 1]. Stored vectors are not required to be
/// unit-normalized; a zero vector carries no direction and scores 0
/// against everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.is_empty() || a.len() != b.len() {
        anyhow::bail!(
            "cannot score embeddings of dimensions {} and {}",
            a.len(),
            b.len()
        );
    }

    let denominator = norm(a) * norm(b);
    if denominator == 0.0 {
        return Ok(0.0);
    }

    // Clamped so accumulated float error never leaks a score above 1
    Ok((dot(a, b) / denominator).clamp(-1.0, 1.0))
}

/// Arithmetic mean of a set of vectors. Used for the retrieval-gating
/// centroid. Returns None for an empty set.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();

    let mut sum = vec![0.0f64; dim];
    for v in vectors {
        debug_assert_eq!(v.len(), dim);
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += *x as f64;
        }
    }

    let n = vectors.len() as f64;
    Some(sum.into_iter().map(|x| (x / n) as f32).collect())
}

/// Maximal marginal relevance selection over pre-computed candidate
/// embeddings. Returns indices into `candidates`, in selection order.
///
/// Objective per step: `lambda * rel(d, q) - (1 - lambda) * max_sim(d, S)`
/// where S is the already-selected set.
pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[Vec<f32>],
    k: usize,
    lambda: f32,
) -> Result<Vec<usize>> {
    if candidates.is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c))
        .collect::<Result<_>>()?;

    let k = k.min(candidates.len());
    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    // Seed with the most relevant candidate
    let seed = remaining
        .iter()
        .copied()
        .max_by(|&a, &b| relevance[a].total_cmp(&relevance[b]))
        .expect("non-empty remaining set");
    selected.push(seed);
    remaining.retain(|&i| i != seed);

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = remaining[0];
        let mut best_score = f32::NEG_INFINITY;

        for &i in &remaining {
            let mut max_redundancy = f32::NEG_INFINITY;
            for &s in &selected {
                let sim = cosine_similarity(&candidates[i], &candidates[s])?;
                if sim > max_redundancy {
                    max_redundancy = sim;
                }
            }

            let score = lambda * relevance[i] - (1.0 - lambda) * max_redundancy;
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }

        selected.push(best_idx);
        remaining.retain(|&i| i != best_idx);
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_ranks_by_alignment() {
        // Scoring three "chunks" against the same query must order them
        // exactly: aligned > oblique > opposed
        let query = vec![2.0, 0.0];
        let aligned = cosine_similarity(&query, &[0.5, 0.0]).unwrap();
        let oblique = cosine_similarity(&query, &[1.0, 1.0]).unwrap();
        let opposed = cosine_similarity(&query, &[-3.0, 0.0]).unwrap();

        assert!((aligned - 1.0).abs() < 1e-6);
        assert!((opposed + 1.0).abs() < 1e-6);
        assert!(aligned > oblique && oblique > opposed);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        // Stored vectors are not unit-normalized; scale must not matter
        let short = cosine_similarity(&[1.0, 1.0], &[0.3, 0.4]).unwrap();
        let long = cosine_similarity(&[10.0, 10.0], &[300.0, 400.0]).unwrap();
        assert!((short - long).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        // Zero vector scores 0 (no direction), never errors
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).unwrap(), 0.0);

        // Mismatched or empty dimensions are a caller bug and must surface
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_err());
        assert!(cosine_similarity(&[], &[]).is_err());
    }

    #[test]
    fn test_mean_vector() {
        let vectors = vec![vec![1.0, 0.0], vec![3.0, 2.0]];
        let mean = mean_vector(&vectors).unwrap();
        assert_eq!(mean, vec![2.0, 1.0]);
        assert!(mean_vector(&[]).is_none());
    }

    #[test]
    fn test_mmr_seeds_with_most_relevant() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            vec![0.0, 1.0],  // orthogonal
            vec![1.0, 0.1],  // near-identical to query
            vec![0.5, 0.5],  // in between
        ];
        let selected = maximal_marginal_relevance(&query, &candidates, 1, 0.5).unwrap();
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn test_mmr_prefers_diversity() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            vec![1.0, 0.0],   // duplicate of query direction
            vec![1.0, 0.01],  // near-duplicate of candidate 0
            vec![0.7, 0.7],   // relevant but different direction
        ];
        // Low lambda weights diversity: the near-duplicate must lose to the
        // diverse candidate in the second slot.
        let selected = maximal_marginal_relevance(&query, &candidates, 2, 0.3).unwrap();
        assert_eq!(selected[0], 0);
        assert_eq!(selected[1], 2);
    }

    #[test]
    fn test_mmr_k_larger_than_candidates() {
        let query = vec![1.0, 0.0];
        let candidates = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let selected = maximal_marginal_relevance(&query, &candidates, 10, 0.5).unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_mmr_empty_candidates() {
        let query = vec![1.0, 0.0];
        let selected = maximal_marginal_relevance(&query, &[], 5, 0.5).unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn test_mmr_lambda_one_is_pure_relevance() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            vec![0.9, 0.1],
            vec![0.95, 0.05],
            vec![0.0, 1.0],
        ];
        let selected = maximal_marginal_relevance(&query, &candidates, 3, 1.0).unwrap();
        assert_eq!(selected, vec![1, 0, 2]);
    }
}
