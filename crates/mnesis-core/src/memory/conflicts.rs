//! Conflict Detection
//!
//! Cheap lexical/polarity heuristic for semantic contradiction between two
//! memory texts. Intentionally false-positive-biased: it flags rather than
//! hides, and final disposition is human (see the conflict workbench).

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "to", "for", "and", "of", "in", "on", "at",
    "with", "my", "your", "their", "his", "her", "this", "that", "it", "be", "as", "by", "from",
];

const NEGATIONS: &[&str] = &[" not ", " never ", " no ", "n't "];
const POSITIVE_PREFS: &[&str] = &["prefer", "like", "love", "enjoy", "use"];
const NEGATIVE_PREFS: &[&str] = &["dislike", "hate", "avoid", "refuse", "never use", "don't like"];

/// Lower-case, collapse whitespace, and pad so word-boundary scans work.
fn normalize_text(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(" {} ", collapsed.to_lowercase())
}

/// Stopword-filtered keyword set (tokens longer than 2 chars).
fn keywords(value: &str) -> HashSet<String> {
    let lowered = value.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// `|A ∩ B| / min(|A|, |B|)`
fn overlap_ratio(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    inter as f64 / a.len().min(b.len()) as f64
}

fn has_negation(normalized: &str) -> bool {
    NEGATIONS.iter().any(|n| normalized.contains(n))
}

/// Sign of (positive-preference verbs) - (negative-preference verbs)
/// - (negation present).
fn polarity_score(value: &str) -> i32 {
    let lowered = value.to_lowercase();
    let padded = format!(" {lowered} ");
    let mut score = 0;
    if POSITIVE_PREFS.iter().any(|k| lowered.contains(k)) {
        score += 1;
    }
    if NEGATIVE_PREFS.iter().any(|k| lowered.contains(k)) {
        score -= 1;
    }
    if NEGATIONS.iter().any(|k| padded.contains(k)) {
        score -= 1;
    }
    score
}

/// Whether two texts look like a semantic contradiction.
///
/// Requires keyword overlap >= 0.30 (they must be about the same thing),
/// then flags on a negation mismatch or opposite preference polarity.
pub fn is_semantic_contradiction(existing: &str, candidate: &str) -> bool {
    if existing.is_empty() || candidate.is_empty() {
        return false;
    }

    let norm_existing = normalize_text(existing);
    let norm_candidate = normalize_text(candidate);
    if norm_existing == norm_candidate {
        return false;
    }

    let overlap = overlap_ratio(&keywords(existing), &keywords(candidate));
    if overlap < 0.30 {
        return false;
    }

    if has_negation(&norm_existing) != has_negation(&norm_candidate) {
        return true;
    }

    polarity_score(existing) * polarity_score(candidate) < 0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_mismatch_is_a_contradiction() {
        assert!(is_semantic_contradiction(
            "Julien prefers Python for backend services.",
            "Julien does not prefer Python for backend services.",
        ));
    }

    #[test]
    fn identical_text_is_not_a_contradiction() {
        let text = "The user prefers Python for backend services.";
        assert!(!is_semantic_contradiction(text, text));
        // Same modulo case/whitespace as well.
        assert!(!is_semantic_contradiction(
            "The user  prefers Python.",
            "the user prefers python."
        ));
    }

    #[test]
    fn unrelated_texts_are_not_contradictions() {
        assert!(!is_semantic_contradiction(
            "The user never eats gluten at breakfast time.",
            "The user works on embedded firmware in Rust.",
        ));
    }

    #[test]
    fn opposite_polarity_is_a_contradiction() {
        assert!(is_semantic_contradiction(
            "The user loves the Vim editor for daily coding.",
            "The user hates the Vim editor for daily coding.",
        ));
    }

    #[test]
    fn agreeing_texts_pass() {
        assert!(!is_semantic_contradiction(
            "The user prefers concise technical answers.",
            "The user likes concise technical responses.",
        ));
    }

    #[test]
    fn empty_inputs_never_flag() {
        assert!(!is_semantic_contradiction("", "The user likes tea."));
        assert!(!is_semantic_contradiction("The user likes tea.", ""));
    }

    #[test]
    fn overlap_ratio_uses_smaller_set() {
        let a: HashSet<String> = ["python", "backend", "services"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let b: HashSet<String> = ["python"].iter().map(|s| s.to_string()).collect();
        assert!((overlap_ratio(&a, &b) - 1.0).abs() < f64::EPSILON);
    }
}
