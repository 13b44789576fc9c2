//! Shared keyword tokenization used by the planner's memory lookup and the
//! judge's keyword-coverage scorer, so both sides agree on what counts as a
//! "word".

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "for", "with", "is", "are",
    "was", "were", "be", "been", "being", "it", "its", "this", "that", "these", "those", "as",
    "at", "by", "from", "into", "about", "over", "after", "before", "than", "then", "so", "if",
    "not", "no", "can", "will", "should", "would", "could", "must", "shall", "do", "does", "did",
    "has", "have", "had", "i", "we", "you", "they", "he", "she", "them", "our", "your", "their",
];

/// Lowercases, strips punctuation, splits on whitespace, drops stopwords and
/// single-character tokens.
pub fn tokenize(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|tok| tok.len() > 1)
        .filter(|tok| !STOPWORDS.contains(tok))
        .map(|tok| tok.to_string())
        .collect()
}

/// De-duplicated, order-preserving keyword extraction.
pub fn keywords(input: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for tok in tokenize(input) {
        if seen.insert(tok.clone()) {
            out.push(tok);
        }
    }
    out
}

/// |tokens(item) ∩ corpus| / |tokens(item)|, 0.0 when item has no tokens.
pub fn keyword_coverage(item: &str, corpus: &std::collections::HashSet<String>) -> f64 {
    let tokens = tokenize(item);
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens.iter().filter(|t| corpus.contains(*t)).count();
    hits as f64 / tokens.len() as f64
}

/// Jaccard similarity between two keyword sets.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: std::collections::HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let sb: std::collections::HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stopwords_and_punctuation() {
        let toks = tokenize("The quick, brown fox jumps over the lazy dog!");
        assert!(!toks.contains(&"the".to_string()));
        assert!(toks.contains(&"quick".to_string()));
        assert!(toks.contains(&"brown".to_string()));
    }

    #[test]
    fn coverage_is_zero_for_empty_item() {
        let corpus = std::collections::HashSet::new();
        assert_eq!(keyword_coverage("", &corpus), 0.0);
    }

    #[test]
    fn jaccard_of_identical_sets_is_one() {
        let a = vec!["a".to_string(), "b".to_string()];
        assert_eq!(jaccard(&a, &a), 1.0);
    }
}
