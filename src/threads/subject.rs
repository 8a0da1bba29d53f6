//! Subject normalization (JWZ style) and subject similarity.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Words that carry no identity in a project name.
const FILLER_WORDS: &[&str] = &[
    "legacy",
    "project",
    "phase",
    "building",
    "center",
    "plaza",
    "development",
];

/// Words a subject can consist of without saying what it is about.
const BOILERPLATE_WORDS: &[&str] = &[
    "no", "subject", "untitled", "hi", "hello", "hey", "fyi", "question", "questions", "update",
    "updates", "follow", "up", "followup", "checking", "in", "thanks", "thank", "you", "test",
    "info", "see", "attached", "attachment", "scan", "scanned", "document", "documents", "message",
    "re", "fw", "fwd", "quick",
];

fn reply_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:(?:re|fwd?|aw|sv|tr|replied)\s*(?:\[\d+\])?\s*:|\[[^\]]*\])\s*")
            .expect("reply prefix regex should compile")
    })
}

fn encoded_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"=\?[^?]+\?[^?]+\?[^?]*\?=").expect("encoded word regex should compile")
    })
}

fn trailing_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s*(?:\([^)]*\)|\[[^\]]*\])\s*$").expect("trailing group regex should compile")
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a subject for threading: strip reply/forward prefixes and
/// bracket tags (repeatedly), drop undecoded RFC 2047 words and trailing
/// parenthesized notes, case-fold, collapse whitespace.
pub fn normalize_subject(subject: &str) -> String {
    let nfkc: String = subject.nfkc().collect();
    let mut s = encoded_word_re().replace_all(&nfkc, " ").into_owned();

    loop {
        let stripped = reply_prefix_re().replace(&s, "").into_owned();
        if stripped == s {
            break;
        }
        s = stripped;
    }
    loop {
        let stripped = trailing_group_re().replace(&s, "").into_owned();
        if stripped == s {
            break;
        }
        s = stripped;
    }

    collapse_whitespace(&s.to_lowercase())
}

/// Normalize free text to lowercase alphanumeric words separated by single
/// spaces. Used for project names, aliases, and phrase matching.
pub fn normalize_phrase(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&folded)
}

/// Tokens of a name that identify it. Filler words are dropped unless
/// nothing else would remain.
pub fn significant_tokens(name: &str) -> Vec<String> {
    let phrase = normalize_phrase(name);
    let all: Vec<String> = phrase.split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect();
    let core: Vec<String> = all
        .iter()
        .filter(|t| !FILLER_WORDS.contains(&t.as_str()))
        .cloned()
        .collect();
    if core.is_empty() {
        all
    } else {
        core
    }
}

/// True if a normalized subject cannot identify a conversation.
pub fn is_generic_subject(normalized: &str) -> bool {
    normalize_phrase(normalized)
        .split(' ')
        .filter(|t| !t.is_empty())
        .all(|t| BOILERPLATE_WORDS.contains(&t))
}

/// Similarity of two normalized subjects in [0, 1]: identical 1.0,
/// containment the length ratio, otherwise Jaccard overlap of words longer
/// than two characters.
pub fn subject_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return if a.is_empty() { 0.0 } else { 1.0 };
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(b) || b.contains(a) {
        let (la, lb) = (a.chars().count() as f64, b.chars().count() as f64);
        return la.min(lb) / la.max(lb);
    }

    let words_a: HashSet<&str> = a.split_whitespace().filter(|w| w.chars().count() > 2).collect();
    let words_b: HashSet<&str> = b.split_whitespace().filter(|w| w.chars().count() > 2).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}
