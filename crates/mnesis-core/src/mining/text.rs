//! Miner Text Heuristics
//!
//! The string-level machinery of conversation analysis: first-person
//! rewriting, list splitting and sentence chunking, generic-fact rejection,
//! contextual enrichment, canonical keys, topic/named tokens, and the
//! per-conversation signal score. English and French are both recognized.
//!
//! Everything here is pure; patterns compile once.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha1::{Digest, Sha1};

use crate::memory::{MemoryCategory, MemoryLevel};

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("valid pattern"));
    };
}

re!(
    FIRST_PERSON,
    r"(?i)\b(i|i'm|i've|i'd|my|mine|me|je|j'|moi|mon|ma|mes|nous|notre|nos)\b"
);
re!(
    USER_ANCHOR,
    r"(?i)\b(the user|user's|l'utilisateur|utilisateur|lutilisateur)\b"
);
re!(BROKEN_USER_ANCHOR, r"(?i)\b(?:the\s+)?user\s*/");
re!(
    GENERIC_FACT,
    r"(?i)\b(is\s+(an?|the)\s+(?:[a-z0-9][a-z0-9_\-]*\s+){0,4}(open|standard|protocol|framework|library|language|concept|method|tool|model)\b|refers to\b|means\b|defined as\b|est\s+(un|une|le|la)\s+(?:[a-z0-9à-ÿ][a-z0-9à-ÿ_\-]*\s+){0,4}(protocole|standard|framework|bibliothèque|bibliotheque|langage|concept|méthode|methode|outil|modèle|modele)\b|fait référence à\b|fait reference a\b|désigne\b|designe\b)"
);
re!(
    DEFINITION_STYLE,
    r"(?i)\b((?:the user|l'utilisateur)\b[^.!?\n]{0,80}\b(?:is|est)\s+(?:an?|the|un|une|le|la)\s+[^.!?\n]{0,80}\b(language|protocol|framework|library|standard|concept|method|tool|model|stack|langage|protocole|bibliothèque|bibliotheque|méthode|methode|outil|modèle|modele)\b|(?:the user|l'utilisateur)\b[^.!?\n]{0,80}\b(?:means|refers to|defined as|désigne|designe|fait référence à|fait reference a)\b)"
);
re!(
    DURABLE_MEMORY,
    r"(?i)\b(prefers|likes|loves|hates|always|never|uses|works on|working on|building|goal|plans|name is|is from|lives in|role|job|team|relationship|project|stack|préfère|prefere|aime|déteste|deteste|utilise|travaille sur|développe|developpe|objectif|projet|nom est|habite|rôle|métier|metier|équipe|equipe|relation)\b"
);
re!(
    QUESTION_STYLE,
    r"(?i)\b(asks?|asked|wants to know|is asking|question|demande|a demandé|a demande|veut savoir)\b"
);
re!(
    TIME_WINDOW,
    r"(?i)\b\d{1,2}(?::|h)\d{2}\s*(?:-|–|to|a|à)\s*\d{1,2}(?::|h)\d{2}\b"
);
re!(
    TIME_HINT,
    r"(?i)\b(today|tomorrow|tonight|this morning|this afternoon|this evening|aujourd'hui|demain|ce matin|cet après-midi|cet apres-midi|ce soir|demain matin|demain soir)\b"
);
re!(
    REASON_CLAUSE,
    r"(?i)\b(?:because|since|due to|car|parce que)\b\s+([^.!?\n]{8,220})"
);
re!(
    NEED_CLAUSE,
    r"(?i)\b(?:i need to|i have to|i must|je dois|il faut que je)\b\s+([^.!?\n]{8,220})"
);
re!(
    VAGUE_CAPABILITY,
    r"(?i)^\s*(?:the user|l'utilisateur)\s+(?:can|could|may|might|peut)\b"
);
re!(
    WEAK_QUALIFIER,
    r"(?i)\b(if needed|if necessary|if required|si besoin|au besoin|more elaborate|more complex|more advanced|additional requests?)\b"
);
re!(REASON_DETAIL, r"(?i)\b(?:because|since|due to|car|parce que|reason:)\b");
re!(DELIVERY_FALLBACK, r"(?i)\bfor a delivery[^.!?\n]{0,180}");
re!(GREETING_PREFIX, r"(?i)^(hello|hi|bonjour|salut)\b[^.!?]{0,80}[.!?]\s*");
re!(
    SECTION_LABEL,
    r"([A-ZÀ-ÖØ-Þ][A-Za-zÀ-ÿ0-9'’\-/ ]{1,28})\s*:\s"
);
re!(SENTENCE_SPLIT, r"[.!?]\s+");
re!(TOPIC_TOKEN, r"[A-Za-zÀ-ÿ0-9][A-Za-zÀ-ÿ0-9_\-]{2,}");
re!(NAMED_TOKEN, r"\b[A-ZÀ-ÖØ-Þ][A-Za-zÀ-ÿ0-9_\-]{2,}\b");

static TOPIC_STOPWORDS: &[&str] = &[
    "the", "this", "that", "these", "those", "with", "from", "into", "about", "your", "their",
    "will", "would", "should", "could", "using", "used", "uses", "user", "users", "application",
    "applications", "system", "saas", "modern", "mobile", "first", "called", "utilize",
    "utilizes", "utiliser", "utilise", "projet", "project", "projects", "pour", "avec", "dans",
    "sur", "des", "une", "les", "est", "sont", "sera", "seront", "lutilisateur", "utilisateur",
];

// ============================================================================
// DETECTION
// ============================================================================

pub fn contains_first_person(text: &str) -> bool {
    FIRST_PERSON.is_match(text)
}

pub fn contains_user_anchor(text: &str) -> bool {
    USER_ANCHOR.is_match(text) && !BROKEN_USER_ANCHOR.is_match(text)
}

/// Vague capability claims ("the user can ... if needed") carry no durable
/// information.
pub fn looks_vague_capability(text: &str) -> bool {
    let value = text.trim();
    if value.is_empty() {
        return true;
    }
    VAGUE_CAPABILITY.is_match(value) && WEAK_QUALIFIER.is_match(value)
}

/// Reject sentences that read like encyclopedia facts instead of personal
/// memories: missing user anchor, definition style, question style, vague
/// capability, broken anchors.
pub fn looks_generic_non_memory(text: &str) -> bool {
    let value = text.trim();
    if value.is_empty() {
        return true;
    }
    if BROKEN_USER_ANCHOR.is_match(value) {
        return true;
    }
    if !contains_user_anchor(value) {
        return true;
    }
    if QUESTION_STYLE.is_match(value) {
        return true;
    }
    if looks_vague_capability(value) {
        return true;
    }
    if DEFINITION_STYLE.is_match(value) && !DURABLE_MEMORY.is_match(value) {
        return true;
    }
    if GENERIC_FACT.is_match(value) && !DURABLE_MEMORY.is_match(value) {
        return true;
    }
    false
}

pub fn looks_truncated(text: &str) -> bool {
    let value = text.trim();
    if value.is_empty() {
        return true;
    }
    if value.contains("...") || value.contains('…') {
        return true;
    }
    let lowered = value.to_lowercase();
    if lowered.ends_with('-')
        || lowered.ends_with(':')
        || lowered.ends_with(';')
        || lowered.ends_with(',')
    {
        return true;
    }
    // A 1-2 char trailing token after a long sentence usually means cut
    // output.
    if value.chars().count() >= 80 {
        if let Some(tail) = value.split_whitespace().last() {
            let tail = tail.trim_matches(|c: char| ".,;:!?".contains(c));
            if (1..=2).contains(&tail.chars().count()) {
                return true;
            }
        }
    }
    false
}

// ============================================================================
// REWRITING
// ============================================================================

/// Rewrite first-person text into third person ("I prefer X" ->
/// "The user prefers X."), in both English and French. Keeps `I/O`-style
/// technical tokens intact.
pub fn to_third_person(text: &str) -> String {
    let mut value = collapse_whitespace(text.trim());
    if value.is_empty() {
        return String::new();
    }

    static I_AM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bI am\b").unwrap());
    static I_M: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bI'm\b").unwrap());
    static LONE_I: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bI\b([^/]|$)").unwrap());
    value = I_AM.replace_all(&value, "The user is").into_owned();
    value = I_M.replace_all(&value, "The user is").into_owned();
    value = LONE_I.replace_all(&value, "the user$1").into_owned();

    for (pattern, replacement) in [
        (r"(?i)\bmy\b", "the user's"),
        (r"(?i)\bmine\b", "the user's"),
        (r"(?i)\bme\b", "the user"),
        (r"(?i)\bje suis\b", "L'utilisateur est"),
        (r"(?i)\bj['’]ai\b", "L'utilisateur a"),
        (r"(?i)\bje\b", "l'utilisateur"),
        (r"(?i)\bmoi\b", "l'utilisateur"),
        (r"(?i)\bmon\b", "le"),
        (r"(?i)\bma\b", "la"),
        (r"(?i)\bmes\b", "les"),
        (r"(?i)\bnous\b", "l'utilisateur"),
        (r"(?i)\bnotre\b", "le"),
        (r"(?i)\bnos\b", "les"),
    ] {
        let re = cached_regex(pattern);
        value = re.replace_all(&value, replacement).into_owned();
    }

    let mut value = collapse_whitespace(&value);
    if value.is_empty() {
        return String::new();
    }
    if !value.ends_with(['.', '!', '?']) {
        value.push('.');
    }
    capitalize_first(&value)
}

/// Per-pattern regex cache for the rewrite table.
fn cached_regex(pattern: &str) -> Regex {
    use std::collections::HashMap;
    use std::sync::Mutex;
    static CACHE: LazyLock<Mutex<HashMap<String, Regex>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));
    let mut cache = CACHE.lock().expect("regex cache lock");
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| Regex::new(pattern).expect("valid pattern"))
        .clone()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ============================================================================
// SPLITTING / CHUNKING
// ============================================================================

/// Split list-like blocks ("... main pillars: Development: ...
/// Entrepreneurship: ...") into atomic segments without truncation.
pub fn split_structured_sections(text: &str) -> Vec<String> {
    let value = collapse_whitespace(text.trim());
    if value.is_empty() {
        return vec![];
    }

    let looks_like_label = |label: &str| {
        let clean = collapse_whitespace(label.trim());
        if clean.is_empty() {
            return false;
        }
        let words: Vec<&str> = clean.split(' ').collect();
        if words.is_empty() || words.len() > 4 {
            return false;
        }
        let lower = clean.to_lowercase();
        if lower.starts_with("the user") || lower.starts_with("l'utilisateur") {
            return false;
        }
        const BLOCKED: &[&str] = &["for", "pour", "principaux", "principales", "main", "piliers"];
        !words.iter().any(|w| BLOCKED.contains(&w.to_lowercase().as_str()))
    };

    let matches: Vec<regex::Match<'_>> = SECTION_LABEL
        .captures_iter(&value)
        .filter_map(|caps| {
            let label = caps.get(1)?;
            if looks_like_label(label.as_str()) {
                caps.get(0)
            } else {
                None
            }
        })
        .collect();
    if matches.len() < 2 {
        return vec![value];
    }

    let prefix = value[..matches[0].start()]
        .trim_matches(|c: char| " .;:-".contains(c))
        .to_string();
    let mut out = Vec::new();
    for (idx, m) in matches.iter().enumerate() {
        let start = m.start();
        let end = matches.get(idx + 1).map_or(value.len(), |next| next.start());
        let section = value[start..end].trim_matches(|c: char| " ;".contains(c));
        if section.is_empty() {
            continue;
        }
        if prefix.is_empty() {
            out.push(section.to_string());
        } else {
            out.push(format!("{prefix} - {section}"));
        }
    }
    if out.is_empty() { vec![value] } else { out }
}

/// Break long text into <= `max_chars` chunks on sentence boundaries,
/// falling back to clause separators and finally hard splits; content is
/// never dropped.
pub fn chunk_text_by_sentences(text: &str, max_chars: usize) -> Vec<String> {
    let value = collapse_whitespace(text.trim());
    if value.is_empty() {
        return vec![];
    }
    if value.chars().count() <= max_chars {
        return vec![value];
    }

    let mut sentences = split_keeping_delimiters(&value, &['.', '!', '?']);
    if sentences.len() <= 1 {
        sentences = split_keeping_delimiters(&value, &[',', ';']);
        if sentences.len() <= 1 {
            sentences = vec![value.clone()];
        }
    }

    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        let candidate = if current.is_empty() {
            sentence.clone()
        } else {
            format!("{current} {sentence}")
        };
        if candidate.chars().count() <= max_chars {
            current = candidate;
            continue;
        }
        if !current.is_empty() {
            out.push(current.trim().to_string());
            current = String::new();
        }
        if sentence.chars().count() <= max_chars {
            current = sentence;
            continue;
        }
        // Still too long: hard chunks, no content dropped.
        let chars: Vec<char> = sentence.chars().collect();
        for piece in chars.chunks(max_chars) {
            let piece: String = piece.iter().collect();
            let piece = piece.trim().to_string();
            if !piece.is_empty() {
                out.push(piece);
            }
        }
    }
    if !current.is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn split_keeping_delimiters(text: &str, delimiters: &[char]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if delimiters.contains(&c) && chars.peek().is_some_and(|n| n.is_whitespace()) {
            out.push(current.trim().to_string());
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Full cleanup pipeline: third-person rewrite, structural splitting,
/// sentence chunking, terminal punctuation, in-call dedup.
pub fn clean_candidate_texts(text: &str, max_chars: usize, max_segments: usize) -> Vec<String> {
    let value = to_third_person(text);
    if value.is_empty() {
        return vec![];
    }

    static LIST_SPLIT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*(?:\n+|;|•|·)\s*").unwrap());
    let mut sections: Vec<String> = Vec::new();
    for block in LIST_SPLIT.split(&value) {
        let chunk = block.trim();
        if chunk.is_empty() {
            continue;
        }
        sections.extend(split_structured_sections(chunk));
    }

    let mut raw_segments: Vec<String> = Vec::new();
    for section in sections {
        raw_segments.extend(chunk_text_by_sentences(&section, max_chars));
    }

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for segment in raw_segments {
        let mut cleaned = collapse_whitespace(&segment);
        if cleaned.is_empty() {
            continue;
        }
        if !cleaned.ends_with(['.', '!', '?']) {
            cleaned.push('.');
        }
        if !seen.insert(cleaned.to_lowercase()) {
            continue;
        }
        out.push(cleaned);
        if out.len() >= max_segments {
            break;
        }
    }
    out
}

// ============================================================================
// ENRICHMENT
// ============================================================================

pub fn sanitize_context_fragment(text: &str, max_chars: usize) -> String {
    let value = collapse_whitespace(text);
    let value = value.trim_matches(|c: char| " .,:;-—".contains(c));
    if value.is_empty() {
        return String::new();
    }
    let mut out: String = value.chars().take(max_chars).collect();
    out = out
        .trim_end_matches(|c: char| " ,;:-".contains(c))
        .to_string();
    out
}

/// Time-of-day fragment from a source message ("tomorrow (09:00-17:00)").
pub fn extract_time_fragment(source_text: &str) -> String {
    let value = collapse_whitespace(source_text.trim());
    if value.is_empty() {
        return String::new();
    }
    let window = TIME_WINDOW
        .find(&value)
        .map(|m| sanitize_context_fragment(m.as_str(), 140))
        .unwrap_or_default();
    let hint = TIME_HINT
        .find(&value)
        .map(|m| sanitize_context_fragment(m.as_str(), 140))
        .unwrap_or_default();
    if !hint.is_empty() && !window.is_empty() {
        return format!("{hint} ({window})");
    }
    if hint.is_empty() { window } else { hint }
}

/// Reason clause from a source message ("because ..." / "I need to ...").
pub fn extract_reason_fragment(source_text: &str) -> String {
    let value = collapse_whitespace(source_text.trim());
    if value.is_empty() {
        return String::new();
    }

    if let Some(caps) = REASON_CLAUSE.captures(&value) {
        return sanitize_context_fragment(&caps[1], 140);
    }
    if let Some(caps) = NEED_CLAUSE.captures(&value) {
        let detail = sanitize_context_fragment(&caps[1], 140);
        if !detail.is_empty() {
            return format!("the user needs to {detail}");
        }
    }
    // Delivery-related fallback often carries the practical constraint.
    if let Some(m) = DELIVERY_FALLBACK.find(&value) {
        return sanitize_context_fragment(m.as_str(), 140);
    }
    String::new()
}

pub fn has_time_detail(text: &str) -> bool {
    TIME_WINDOW.is_match(text) || TIME_HINT.is_match(text)
}

pub fn has_reason_detail(text: &str) -> bool {
    REASON_DETAIL.is_match(&text.to_lowercase())
}

pub fn contains_contextual_detail(text: &str) -> bool {
    has_time_detail(text) || has_reason_detail(text)
}

/// Short excerpt of a source message with greeting prefixes stripped.
pub fn build_source_excerpt(source_text: &str, max_chars: usize) -> String {
    let value = collapse_whitespace(source_text.trim());
    if value.is_empty() {
        return String::new();
    }
    let value = GREETING_PREFIX.replace(&value, "").trim().to_string();
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= max_chars {
        return value;
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end_matches(|c: char| " ,;:-".contains(c)))
}

/// Append time-window, reason, or a short excerpt from the source message
/// to a weak candidate, keeping the result user-centric and under 420
/// chars.
pub fn enrich_candidate_with_source_context(content: &str, source_text: &str) -> String {
    let base = content.trim();
    let source = source_text.trim();
    if base.is_empty() || source.is_empty() {
        return base.to_string();
    }
    if base.chars().count() >= 340 {
        return base.to_string();
    }
    let base_has_time = has_time_detail(base);
    let base_has_reason = has_reason_detail(base);
    if base_has_time && base_has_reason {
        return base.to_string();
    }

    let lowered_base = base.to_lowercase();
    let mut additions: Vec<String> = Vec::new();

    let time_fragment = extract_time_fragment(source);
    if !time_fragment.is_empty()
        && !base_has_time
        && !lowered_base.contains(&time_fragment.to_lowercase())
    {
        additions.push(time_fragment);
    }
    let reason_fragment = extract_reason_fragment(source);
    if !reason_fragment.is_empty()
        && !base_has_reason
        && !lowered_base.contains(&reason_fragment.to_lowercase())
    {
        additions.push(format!("reason: {reason_fragment}"));
    }

    // Weak short claims get a compact excerpt so the memory is not
    // contextless.
    if additions.is_empty() && base.chars().count() < 96 {
        let excerpt = build_source_excerpt(source, 90);
        if !excerpt.is_empty() {
            let excerpt = to_third_person(&excerpt);
            let excerpt = excerpt.trim().trim_end_matches('.').to_string();
            if !excerpt.is_empty()
                && !contains_first_person(&excerpt)
                && !lowered_base.contains(&excerpt.to_lowercase())
            {
                additions.push(excerpt);
            }
        }
    }

    if additions.is_empty() {
        return base.to_string();
    }

    let trimmed_base = base.trim_end_matches(|c: char| " .;".contains(c));
    let enriched = format!("{trimmed_base} ({}).", additions.join("; "));
    if enriched.chars().count() <= 420 {
        return enriched;
    }
    // Keep only one strongest fragment when close to max length.
    for fragment in &additions {
        let trial = format!("{trimmed_base} ({fragment}).");
        if trial.chars().count() <= 420 {
            return trial;
        }
    }
    base.to_string()
}

/// Content-quality ranking used when merging candidates: rewards
/// time-window and reason clauses, penalizes vague capability phrasing.
pub fn content_quality_score(text: &str) -> f64 {
    let value = text.trim();
    if value.is_empty() {
        return -1.0;
    }
    let mut score = 0.0;
    score += (value.chars().count() as f64 / 420.0).min(0.6);
    if contains_contextual_detail(value) {
        score += 1.4;
    }
    if !extract_reason_fragment(value).is_empty() {
        score += 0.6;
    }
    if has_time_detail(value) {
        score += 0.4;
    }
    if looks_vague_capability(value) {
        score -= 1.2;
    }
    score
}

// ============================================================================
// CANONICAL KEYS / TOKENS
// ============================================================================

pub fn normalize_for_dedupe(text: &str) -> String {
    collapse_whitespace(&text.to_lowercase())
        .trim_matches(|c: char| " .;".contains(c))
        .to_string()
}

pub fn canonicalize_candidate_text(text: &str) -> String {
    let value = normalize_for_dedupe(text);
    let filtered: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || ('\u{00e0}'..='\u{00ff}').contains(&c)
                || c == '_'
                || c == '-'
            {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&filtered)
}

/// `sha1(category | level | canonicalize(content))`
pub fn candidate_key(content: &str, category: MemoryCategory, level: MemoryLevel) -> String {
    let canonical = format!(
        "{}|{}|{}",
        category.as_str(),
        level.as_str(),
        canonicalize_candidate_text(content)
    );
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Topic tokens: lowercase, >= 4 chars, stopword-filtered.
pub fn extract_topic_tokens(text: &str) -> HashSet<String> {
    let lowered = text.to_lowercase();
    TOPIC_TOKEN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.chars().count() >= 4 && !TOPIC_STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Branded-entity tokens (HomeBoard, Notion, Stripe, ...): capitalized in
/// the source, compared lowercase.
pub fn extract_named_tokens(text: &str) -> HashSet<String> {
    NAMED_TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !TOPIC_STOPWORDS.contains(&t.as_str()))
        .collect()
}

pub fn looks_like_project_followup(text: &str) -> bool {
    let value = text.trim().to_lowercase();
    if value.is_empty() {
        return false;
    }
    const PREFIXES: &[&str] = &[
        "the application ",
        "this application ",
        "the app ",
        "this app ",
        "the project ",
        "this project ",
        "the product ",
        "it will ",
        "it is ",
        "it should ",
    ];
    PREFIXES.iter().any(|prefix| value.starts_with(prefix))
}

// ============================================================================
// SIGNAL / SNIPPETS
// ============================================================================

re!(
    SIGNAL_SELF,
    r"(?i)\b(i|i'm|my|me|je|j'|moi|mon|ma|mes)\b"
);
re!(
    SIGNAL_PREFERENCE,
    r"(?i)\b(prefer|like|love|hate|always|never|prefere|aime|deteste|toujours|jamais)\b"
);
re!(
    SIGNAL_WORK,
    r"(?i)\b(work on|building|project|stack|use|travaille sur|projet|utilise|developpe)\b"
);

/// Heuristic estimate of how much durable user information a conversation's
/// user messages carry. First-person statements and preference/work verbs
/// score; short messages are ignored.
pub fn conversation_signal_score(messages: &[(String, String)]) -> i64 {
    let mut score = 0i64;
    for (role, content) in messages {
        if role.to_lowercase() != "user" {
            continue;
        }
        let text = content.to_lowercase();
        if text.chars().count() < 24 {
            continue;
        }
        if SIGNAL_SELF.is_match(&text) {
            score += 2;
        }
        if SIGNAL_PREFERENCE.is_match(&text) {
            score += 2;
        }
        if SIGNAL_WORK.is_match(&text) {
            score += 1;
        }
    }
    score
}

/// Text following a heuristic marker ("my name is ", "i prefer ", ...).
pub fn extract_snippet(text: &str, marker: &str) -> String {
    let lower = text.to_lowercase();
    let Some(idx) = lower.find(marker) else {
        return String::new();
    };
    let start = idx + marker.len();
    let snippet = text
        .get(start..)
        .unwrap_or("")
        .trim_matches(|c: char| " :,-".contains(c));
    let snippet = collapse_whitespace(snippet);
    if snippet.chars().count() > 140 {
        let cut: String = snippet.chars().take(140).collect();
        format!("{}...", cut.trim_end())
    } else {
        snippet
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_definition_is_rejected() {
        // The C++ encyclopedia sentence from the quality guardrails.
        assert!(looks_generic_non_memory(
            "The user says C++ is a high-performance, compiled language that provides \
             direct access to hardware resources such as memory and I/O operations."
        ));
        // A durable personal fact with the same subject passes.
        assert!(!looks_generic_non_memory(
            "The user uses C++ daily for embedded systems at work."
        ));
    }

    #[test]
    fn missing_user_anchor_is_rejected() {
        assert!(looks_generic_non_memory(
            "Rust is a systems programming language focused on safety."
        ));
    }

    #[test]
    fn question_style_is_rejected() {
        assert!(looks_generic_non_memory(
            "The user asks how to configure nginx reverse proxies."
        ));
    }

    #[test]
    fn vague_capability_is_rejected() {
        assert!(looks_generic_non_memory(
            "The user can write more elaborate documentation if needed."
        ));
        assert!(!looks_generic_non_memory(
            "The user can deploy to production every Friday because the team ships weekly."
        ));
    }

    #[test]
    fn broken_anchor_is_rejected() {
        assert!(looks_generic_non_memory(
            "The user/ system boundary is defined in the gateway."
        ));
    }

    #[test]
    fn third_person_rewrite() {
        assert_eq!(
            to_third_person("I prefer concise answers"),
            "The user prefer concise answers."
        );
        // "I'm" and "my" both rewrite.
        let rewritten = to_third_person("I'm working on my dashboard");
        assert!(rewritten.starts_with("The user is working on the user's dashboard"));
        // Technical I/O tokens survive.
        let io = to_third_person("I benchmark I/O throughput weekly");
        assert!(io.contains("I/O"));
        assert!(io.starts_with("The user benchmark"));
    }

    #[test]
    fn third_person_adds_terminal_punctuation() {
        let out = to_third_person("I use Neovim");
        assert!(out.ends_with('.'));
        assert!(!contains_first_person(&out));
    }

    #[test]
    fn structured_sections_split() {
        let segments = split_structured_sections(
            "The user organizes work around pillars - Development: building the core product. \
             Entrepreneurship: growing the consulting side.",
        );
        assert_eq!(segments.len(), 2);
        assert!(segments[0].contains("Development:"));
        assert!(segments[1].contains("Entrepreneurship:"));
    }

    #[test]
    fn chunking_respects_max_chars_without_losing_content() {
        let text = "First sentence about the user. Second sentence about work. \
                    Third sentence about preferences. Fourth sentence about goals.";
        let chunks = chunk_text_by_sentences(text, 70);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 70);
        }
        let rejoined = chunks.join(" ");
        assert!(rejoined.contains("Fourth sentence"));
    }

    #[test]
    fn clean_candidate_texts_dedups_and_caps_segments() {
        let out = clean_candidate_texts("I like tea; I like tea; I like coffee", 420, 3);
        assert_eq!(out.len(), 2);
        assert!(out[0].to_lowercase().contains("tea"));
        assert!(out[1].to_lowercase().contains("coffee"));
    }

    #[test]
    fn enrichment_appends_time_and_reason() {
        let enriched = enrich_candidate_with_source_context(
            "The user wants groceries delivered.",
            "I need them tomorrow between 09:00-17:00 because I host a dinner party",
        );
        assert!(enriched.contains("tomorrow"));
        assert!(enriched.contains("reason:"));
        assert!(enriched.chars().count() <= 420);
    }

    #[test]
    fn enrichment_skips_when_context_already_present() {
        let base = "The user wants groceries delivered tomorrow because guests arrive.";
        let enriched =
            enrich_candidate_with_source_context(base, "random source text with no signal");
        assert_eq!(enriched, base);
    }

    #[test]
    fn quality_score_prefers_contextual_content() {
        let rich = content_quality_score(
            "The user blocks 09:00-12:00 for deep work because mornings are quiet.",
        );
        let vague = content_quality_score("The user can help with tasks if needed.");
        assert!(rich > vague);
        assert!(content_quality_score("") < 0.0);
    }

    #[test]
    fn canonical_key_collapses_punctuation_and_case() {
        let a = candidate_key(
            "The user prefers  concise answers!",
            MemoryCategory::Preferences,
            MemoryLevel::Semantic,
        );
        let b = candidate_key(
            "the user prefers concise answers",
            MemoryCategory::Preferences,
            MemoryLevel::Semantic,
        );
        assert_eq!(a, b);

        // Category and level participate in the key.
        let c = candidate_key(
            "the user prefers concise answers",
            MemoryCategory::Skills,
            MemoryLevel::Semantic,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn truncation_detection() {
        assert!(looks_truncated("The user prefers..."));
        assert!(looks_truncated("The user prefers:"));
        assert!(!looks_truncated("The user prefers concise answers."));
    }

    #[test]
    fn signal_score_counts_first_person_preferences() {
        let messages = vec![
            (
                "user".to_string(),
                "I prefer concise technical answers with direct action items.".to_string(),
            ),
            ("assistant".to_string(), "Understood, I will keep it short.".to_string()),
            ("user".to_string(), "ok".to_string()),
        ];
        // First user message: self (2) + preference (2) = 4; assistant and
        // short messages are ignored.
        assert_eq!(conversation_signal_score(&messages), 4);
    }

    #[test]
    fn snippet_extraction() {
        assert_eq!(
            extract_snippet("Hi, my name is Julien and I build things", "my name is "),
            "Julien and I build things"
        );
        assert_eq!(extract_snippet("no marker here", "my name is "), "");
    }

    #[test]
    fn topic_and_named_tokens() {
        let topics = extract_topic_tokens("The user is building HomeBoard with SvelteKit");
        assert!(topics.contains("homeboard"));
        assert!(topics.contains("sveltekit"));
        assert!(!topics.contains("user"));

        let named = extract_named_tokens("The user ships HomeBoard through Vercel");
        assert!(named.contains("homeboard"));
        assert!(named.contains("vercel"));
        assert!(!named.contains("the"));
    }
}
