//! Significant-word extraction used by the keyword half of hybrid retrieval.
//!
//! Deliberately simple: lowercase, strip accents, drop stopwords and anything
//! shorter than two characters. English and Spanish stopwords are both
//! included since the wider runtime targets Spanish-speaking users at the
//! channel boundary (see the error-handling design note on locale).

const STOPWORDS: &[&str] = &[
    // English
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "at", "for", "and", "or", "but", "with", "it", "this", "that", "these", "those", "i", "you",
    "he", "she", "we", "they", "do", "does", "did", "have", "has", "had", "not", "no", "yes",
    "what", "when", "where", "who", "how", "why", "can", "could", "would", "should", "will",
    // Spanish
    "el", "la", "los", "las", "un", "una", "unos", "unas", "es", "son", "fue", "fueron", "de",
    "en", "para", "por", "y", "o", "pero", "con", "esto", "eso", "esta", "ese", "yo", "tu", "el",
    "ella", "nosotros", "ellos", "que", "quien", "donde", "como", "por que", "cuando", "si", "no",
];

/// Extract lowercased, accent-stripped, stopword-filtered words of at least
/// two characters from `text`. Order of first appearance is preserved;
/// duplicates are removed.
pub fn significant_words(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for raw_word in text.split(|c: char| !c.is_alphanumeric()) {
        if raw_word.is_empty() {
            continue;
        }
        let word = strip_accents(&raw_word.to_lowercase());
        if word.chars().count() < 2 {
            continue;
        }
        if STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if seen.insert(word.clone()) {
            out.push(word);
        }
    }
    out
}

/// Best-effort accent stripping for the Latin-1 supplement range commonly
/// seen in Spanish text (á é í ó ú ñ ü and their uppercase forms — already
/// lowercased by the caller).
fn strip_accents(word: &str) -> String {
    word.chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Jaccard-style overlap score used by the keyword half of hybrid retrieval:
/// `|query ∩ fact| / |query|`.
pub fn keyword_overlap_score(query_words: &[String], fact_words: &[String]) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let fact_set: std::collections::HashSet<&str> =
        fact_words.iter().map(String::as_str).collect();
    let matches = query_words
        .iter()
        .filter(|w| fact_set.contains(w.as_str()))
        .count();
    matches as f32 / query_words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_short_words_and_stopwords() {
        let words = significant_words("the cat is on a mat");
        assert_eq!(words, vec!["cat", "mat"]);
    }

    #[test]
    fn strips_accents_and_lowercases() {
        let words = significant_words("Mañana vamos a Kubernetes");
        assert!(words.contains(&"manana".to_string()));
        assert!(words.contains(&"kubernetes".to_string()));
    }

    #[test]
    fn overlap_score_is_fraction_of_query_words() {
        let query = significant_words("deployments en k8s");
        let fact = significant_words("hablamos de deployments de k8s ayer");
        let score = keyword_overlap_score(&query, &fact);
        assert!(score > 0.5);
    }

    #[test]
    fn overlap_score_zero_for_empty_query() {
        assert_eq!(keyword_overlap_score(&[], &["cat".to_string()]), 0.0);
    }
}
