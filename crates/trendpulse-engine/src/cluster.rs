use trendpulse_vector::cosine_similarity;

use crate::textsim::title_bigram_jaccard;

/// Greedy single-pass clustering over a window's item vectors.
///
/// Each not-yet-assigned item seeds a cluster and captures every later item
/// that clears BOTH gates against the seed: cosine similarity on the
/// embeddings and bigram Jaccard on the titles. Embeddings alone will group
/// topically unrelated items with similar style; the title gate cheaply
/// rejects those.
///
/// Returns index groups into the input slices; every index appears in
/// exactly one group.
pub fn greedy_cluster(
    vectors: &[Vec<f32>],
    titles: &[&str],
    vector_threshold: f64,
    title_threshold: f64,
) -> Vec<Vec<usize>> {
    assert_eq!(vectors.len(), titles.len());

    let n = vectors.len();
    let mut assigned = vec![false; n];
    let mut groups = Vec::new();

    for i in 0..n {
        if assigned[i] {
            continue;
        }
        assigned[i] = true;
        let mut group = vec![i];

        for j in (i + 1)..n {
            if assigned[j] {
                continue;
            }
            let cos = cosine_similarity(&vectors[i], &vectors[j]) as f64;
            if cos < vector_threshold {
                continue;
            }
            if title_bigram_jaccard(titles[i], titles[j]) < title_threshold {
                continue;
            }
            assigned[j] = true;
            group.push(j);
        }

        groups.push(group);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clusters_by_both_gates() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.05, 0.0], // similar vector, similar title -> joins
            vec![0.99, 0.05, 0.0], // similar vector, unrelated title -> rejected
            vec![0.0, 1.0, 0.0],   // dissimilar vector -> own cluster
        ];
        let titles = vec![
            "某明星官宣结婚",
            "某明星官宣结婚引热议",
            "完全无关的比赛结果公布",
            "某明星官宣结婚",
        ];

        let groups = greedy_cluster(&vectors, &titles, 0.85, 0.3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![0, 1]);
        assert_eq!(groups[1], vec![2]);
        assert_eq!(groups[2], vec![3]);
    }

    #[test]
    fn test_every_index_assigned_once() {
        let vectors: Vec<Vec<f32>> = (0..7).map(|i| vec![i as f32, 1.0]).collect();
        let titles: Vec<&str> = (0..7).map(|_| "t").collect();

        let groups = greedy_cluster(&vectors, &titles, 0.99, 0.9);
        let mut seen: Vec<usize> = groups.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let groups = greedy_cluster(&[], &[], 0.85, 0.6);
        assert!(groups.is_empty());
    }
}
