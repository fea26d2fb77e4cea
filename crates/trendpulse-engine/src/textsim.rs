use std::collections::HashSet;

/// Character-bigram Jaccard similarity between two titles.
///
/// Operates on Unicode scalar values, so CJK titles compare by character
/// pairs rather than bytes. Titles shorter than one bigram score 0.0.
pub fn title_bigram_jaccard(a: &str, b: &str) -> f64 {
    let bigrams_a = bigrams(a);
    let bigrams_b = bigrams(b);

    if bigrams_a.is_empty() || bigrams_b.is_empty() {
        return 0.0;
    }

    let intersection = bigrams_a.intersection(&bigrams_b).count();
    let union = bigrams_a.union(&bigrams_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_titles() {
        assert_eq!(title_bigram_jaccard("某地发生地震", "某地发生地震"), 1.0);
    }

    #[test]
    fn test_disjoint_titles() {
        assert_eq!(title_bigram_jaccard("abcd", "wxyz"), 0.0);
    }

    #[test]
    fn test_partial_overlap() {
        // bigrams("abcd") = {ab, bc, cd}; bigrams("abce") = {ab, bc, ce}
        // intersection 2, union 4
        assert!((title_bigram_jaccard("abcd", "abce") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_near_identical_cjk_titles() {
        let sim = title_bigram_jaccard("四川凉山发生5.0级地震", "四川凉山发生地震");
        assert!(sim > 0.6, "similar headlines should pass the gate: {}", sim);
    }

    #[test]
    fn test_short_inputs() {
        assert_eq!(title_bigram_jaccard("a", "ab"), 0.0);
        assert_eq!(title_bigram_jaccard("", ""), 0.0);
    }
}
