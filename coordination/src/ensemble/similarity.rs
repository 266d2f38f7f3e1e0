//! Caption similarity
//!
//! Mean n-gram F1 over orders `1..=max_n`, with clipped multiset counts.
//! Tokens are lower-cased whitespace words with surrounding ASCII
//! punctuation removed, so "A cat." and "a cat" compare equal.

use std::collections::HashMap;

/// Lower-case, punctuation-trimmed word tokens
pub fn tokenize(caption: &str) -> Vec<String> {
    caption
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if n == 0 || tokens.len() < n {
        return counts;
    }
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// F1 of order-`n` n-grams, or `None` when neither side has any
fn ngram_f1(a: &[String], b: &[String], n: usize) -> Option<f64> {
    let ca = ngram_counts(a, n);
    let cb = ngram_counts(b, n);
    let total_a: usize = ca.values().sum();
    let total_b: usize = cb.values().sum();

    if total_a == 0 && total_b == 0 {
        return None;
    }
    if total_a == 0 || total_b == 0 {
        return Some(0.0);
    }

    let overlap: usize = ca
        .iter()
        .map(|(gram, &count)| count.min(cb.get(gram).copied().unwrap_or(0)))
        .sum();
    if overlap == 0 {
        return Some(0.0);
    }

    let precision = overlap as f64 / total_a as f64;
    let recall = overlap as f64 / total_b as f64;
    Some(2.0 * precision * recall / (precision + recall))
}

/// Symmetric similarity in `[0, 1]` between two token sequences
pub fn token_similarity(a: &[String], b: &[String], max_n: usize) -> f64 {
    let scores: Vec<f64> = (1..=max_n.max(1))
        .filter_map(|n| ngram_f1(a, b, n))
        .collect();

    if scores.is_empty() {
        // Neither side has even a unigram
        return if a == b { 1.0 } else { 0.0 };
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Convenience wrapper over raw caption strings
pub fn caption_similarity(a: &str, b: &str, max_n: usize) -> f64 {
    token_similarity(&tokenize(a), &tokenize(b), max_n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("  A man, riding a Horse. "),
            vec!["a", "man", "riding", "a", "horse"]
        );
        assert!(tokenize(" ... ").is_empty());
    }

    #[test]
    fn test_identical_is_one() {
        assert!(approx(caption_similarity("a cat on a mat", "A cat on a mat.", 2), 1.0));
    }

    #[test]
    fn test_disjoint_is_zero() {
        assert!(approx(caption_similarity("a cat", "two dogs", 2), 0.0));
    }

    #[test]
    fn test_unigram_f1() {
        // overlap {a, car}: P = 2/2, R = 2/3
        assert!(approx(caption_similarity("a car", "a red car", 1), 0.8));
        // bigrams share nothing, so order 2 halves the score
        assert!(approx(caption_similarity("a car", "a red car", 2), 0.4));
    }

    #[test]
    fn test_clipped_counts() {
        // "a a a" vs "a": one clipped match, P = 1/3, R = 1
        assert!(approx(caption_similarity("a a a", "a", 1), 0.5));
    }

    #[test]
    fn test_single_word_skips_empty_order() {
        // Neither side has a bigram, so only unigrams count
        assert!(approx(caption_similarity("dog", "dog", 2), 1.0));
        assert!(approx(caption_similarity("dog", "cat", 2), 0.0));
    }

    #[test]
    fn test_empty_captions() {
        assert!(approx(token_similarity(&[], &[], 2), 1.0));
        assert!(approx(caption_similarity("", "a cat", 2), 0.0));
    }

    #[test]
    fn test_symmetric() {
        let a = "a man riding a wave on a surfboard";
        let b = "a surfer riding a large wave";
        assert!(approx(caption_similarity(a, b, 2), caption_similarity(b, a, 2)));
    }
}
