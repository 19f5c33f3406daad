use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Source term -> replacement, applied before any text reaches the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Glossary {
    terms: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    terminology: BTreeMap<String, String>,
}

impl Glossary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read terminology: {}", path.display()))?;
        let file: GlossaryFile = serde_json::from_str(text.trim_start_matches('\u{FEFF}'))
            .with_context(|| format!("parse terminology: {}", path.display()))?;
        Ok(Self::from_iter(file.terminology))
    }

    pub fn insert(&mut self, src: impl Into<String>, tgt: impl Into<String>) {
        let src = src.into();
        if src.is_empty() {
            return;
        }
        self.terms.insert(src, tgt.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Content hash of the sorted entries. Two glossaries with the same entries share a key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (src, tgt) in &self.terms {
            hasher.update(src.as_bytes());
            hasher.update([0u8]);
            hasher.update(tgt.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Glossary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut g = Glossary::new();
        for (k, v) in iter {
            g.insert(k, v);
        }
        g
    }
}

/// One compiled alternation over every glossary term, longest terms first.
#[derive(Debug)]
pub struct TermMatcher {
    combined: Option<Regex>,
    // Same order as the alternation; used when the leftmost alternative fails the trailing guard.
    anchored: Vec<Regex>,
    replacements: HashMap<String, String>,
}

impl TermMatcher {
    pub fn compile(glossary: &Glossary) -> anyhow::Result<Self> {
        let mut terms: Vec<(&str, &str)> = glossary.iter().collect();
        terms.sort_by(|a, b| {
            b.0.chars()
                .count()
                .cmp(&a.0.chars().count())
                .then_with(|| a.0.cmp(b.0))
        });

        let mut replacements = HashMap::with_capacity(terms.len());
        let mut anchored = Vec::with_capacity(terms.len());
        let mut alts = Vec::with_capacity(terms.len());
        for (src, tgt) in &terms {
            let escaped = regex::escape(src);
            anchored.push(
                RegexBuilder::new(&format!("^(?:{escaped})"))
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compile term: {src}"))?,
            );
            alts.push(escaped);
            replacements.insert(src.to_lowercase(), (*tgt).to_string());
        }

        let combined = if alts.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&alts.join("|"))
                    .case_insensitive(true)
                    .size_limit(64 * 1024 * 1024)
                    .build()
                    .context("compile terminology pattern")?,
            )
        };

        Ok(Self {
            combined,
            anchored,
            replacements,
        })
    }

    /// Replaces every guarded term occurrence. Returns the new text and whether anything changed.
    #[must_use]
    pub fn apply(&self, text: &str) -> (String, bool) {
        let Some(combined) = self.combined.as_ref() else {
            return (text.to_string(), false);
        };
        if text.is_empty() {
            return (String::new(), false);
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0usize;
        let mut pos = 0usize;
        while pos < text.len() {
            let Some(m) = combined.find_at(text, pos) else {
                break;
            };
            let start = m.start();
            match self.guarded_end(text, start, m.end()) {
                Some(end) => {
                    let matched = &text[start..end];
                    let repl = self
                        .replacements
                        .get(&matched.to_lowercase())
                        .map(String::as_str)
                        .unwrap_or(matched);
                    out.push_str(&text[last..start]);
                    out.push_str(repl);
                    last = end;
                    pos = end;
                }
                None => {
                    pos = start + text[start..].chars().next().map_or(1, char::len_utf8);
                }
            }
        }
        out.push_str(&text[last..]);
        let changed = out != text;
        (out, changed)
    }

    fn guarded_end(&self, text: &str, start: usize, first_end: usize) -> Option<usize> {
        if text[..start].chars().next_back().is_some_and(is_word_char) {
            return None;
        }
        if !followed_by_word(text, first_end) {
            return Some(first_end);
        }
        let rest = &text[start..];
        self.anchored.iter().find_map(|re| {
            let end = start + re.find(rest)?.end();
            (!followed_by_word(text, end)).then_some(end)
        })
    }
}

fn followed_by_word(text: &str, at: usize) -> bool {
    text[at..].chars().next().is_some_and(is_word_char)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Compiled matchers for one pipeline run, keyed by glossary content hash.
#[derive(Default)]
pub struct TermCache {
    matchers: HashMap<String, Arc<TermMatcher>>,
}

impl TermCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matcher_for(&mut self, glossary: &Glossary) -> anyhow::Result<Arc<TermMatcher>> {
        let key = glossary.cache_key();
        if let Some(m) = self.matchers.get(&key) {
            return Ok(Arc::clone(m));
        }
        let matcher = Arc::new(TermMatcher::compile(glossary)?);
        self.matchers.insert(key, Arc::clone(&matcher));
        Ok(matcher)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}
