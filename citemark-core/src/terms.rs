//! Search-term extraction from mixed-script citation snippets.
//!
//! CJK text has no word boundaries the lookup service could rely on, so it is
//! turned into overlapping n-grams. Latin text contributes whole tokens.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

pub const MAX_CJK_GRAM: usize = 6;
pub const MIN_CJK_GRAM: usize = 3;
pub const MAX_CJK_TERMS: usize = 6;
pub const MAX_LATIN_TERMS: usize = 6;

static LATIN_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9._\-/]{2,}").expect("valid latin token regex"));

const MARKUP_ARTIFACTS: [&str; 3] = ["```", "$begin:math:display$", "$end:math:display$"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermKind {
    Cjk,
    Latin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTerm {
    pub text: String,
    pub kind: TermKind,
}

/// What a citation boils down to before any lookup request is made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSet {
    /// Compact normalized seed, sent as a best-effort phrase.
    pub phrase: String,
    pub terms: Vec<SearchTerm>,
}

impl TermSet {
    /// An empty set means there is nothing to search for.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.phrase.is_empty()
    }

    pub fn texts(&self) -> Vec<String> {
        self.terms.iter().map(|term| term.text.clone()).collect()
    }

    pub fn of_kind(&self, kind: TermKind) -> impl Iterator<Item = &SearchTerm> {
        self.terms.iter().filter(move |term| term.kind == kind)
    }

    /// Stable identity of the inputs; a change means a new session.
    pub fn key(&self) -> String {
        let mut key = self.phrase.clone();
        for term in &self.terms {
            key.push('|');
            key.push_str(&term.text);
        }
        key
    }
}

/// Extracts the term set for a highlight seed plus auxiliary queries.
pub fn extract_terms(seed: &str, queries: &[String]) -> TermSet {
    let cjk = build_cjk_terms(seed, MAX_CJK_TERMS);
    let latin = latin_terms(seed, queries, MAX_LATIN_TERMS);
    let terms = merge_terms(cjk, latin);
    let phrase = normalize_phrase(seed);
    // Too short for n-grams, but a CJK phrase is still worth a lookup.
    if terms.is_empty() && !phrase.chars().any(is_cjk) {
        return TermSet::default();
    }
    TermSet { phrase, terms }
}

/// NFKC, markup stripped, whitespace removed, dashes unified.
pub fn normalize_phrase(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut text: String = input.nfkc().collect();
    for artifact in MARKUP_ARTIFACTS {
        text = text.replace(artifact, "");
    }
    text.chars()
        .filter(|c| !c.is_whitespace() && !is_invisible(*c))
        .map(|c| match c {
            '\u{2010}' | '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect()
}

/// Han, Hiragana or Katakana.
pub fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}')
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{00A0}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}

fn build_cjk_terms(input: &str, max: usize) -> Vec<SearchTerm> {
    let compact: Vec<char> = normalize_phrase(input).chars().collect();
    if !compact.iter().any(|c| is_cjk(*c)) {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for n in (MIN_CJK_GRAM..=MAX_CJK_GRAM).rev() {
        if compact.len() < n {
            continue;
        }
        for window in compact.windows(n) {
            if !window.iter().any(|c| is_cjk(*c)) {
                continue;
            }
            let slice: String = window.iter().collect();
            if seen.insert(slice.clone()) {
                terms.push(SearchTerm {
                    text: slice,
                    kind: TermKind::Cjk,
                });
                if terms.len() >= max {
                    return terms;
                }
            }
        }
    }
    terms
}

fn latin_terms(seed: &str, queries: &[String], max: usize) -> Vec<SearchTerm> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    let sources = std::iter::once(seed).chain(queries.iter().map(String::as_str));
    for text in sources {
        if text.is_empty() {
            continue;
        }
        let normalized: String = text.nfkc().collect();
        for token in LATIN_TOKEN.find_iter(&normalized) {
            let clean = token.as_str().trim();
            if clean.is_empty() || !seen.insert(clean.to_string()) {
                continue;
            }
            terms.push(SearchTerm {
                text: clean.to_string(),
                kind: TermKind::Latin,
            });
            if terms.len() >= max {
                return terms;
            }
        }
    }
    terms
}

fn merge_terms(primary: Vec<SearchTerm>, secondary: Vec<SearchTerm>) -> Vec<SearchTerm> {
    let mut seen = HashSet::new();
    primary
        .into_iter()
        .chain(secondary)
        .filter_map(|mut term| {
            let trimmed = term.text.trim();
            if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
                return None;
            }
            term.text = trimmed.to_string();
            Some(term)
        })
        .collect()
}
