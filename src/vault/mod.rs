//! Reversible PII tokenization.
//!
//! A [`Vault`] replaces sensitive values with opaque tokens of the form
//! `[REF_<CATEGORY>_<n>]` before text crosses the trust boundary, and maps
//! tokens back to real values in the model's output. The mapping never
//! leaves the process.
//!
//! Tokenization is deterministic: the same transcript always yields the same
//! tokens, because sequence numbers follow first-seen (left-to-right) order
//! per category. A fresh vault is built for every call so tokens from one
//! transcript can never resolve inside another.

pub mod patterns;

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

pub use patterns::Category;
use patterns::{default_patterns, is_isolated, token_pattern};

/// Errors raised while restoring model output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    /// The text contains a token this vault never issued.
    #[error("token {token} was never issued by this vault")]
    UnknownToken {
        /// The offending token, verbatim.
        token: String,
    },
}

/// One `(real_value, token, category)` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEntry {
    /// The sensitive value as it appeared in the source.
    pub real_value: String,
    /// The placeholder issued for it.
    pub token: String,
    /// Detected category.
    pub category: Category,
}

/// Output of [`Vault::tokenize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokenized {
    /// Text with every detected value replaced by its token.
    pub text: String,
    /// Entries issued by this call (values already mapped are not repeated).
    pub added: Vec<VaultEntry>,
}

/// A located value awaiting replacement.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    category: Category,
}

/// Bidirectional real-value ↔ token mapping for one call.
#[derive(Debug, Default)]
pub struct Vault {
    /// Structured values known up front (names, phone numbers, case ids).
    known: Vec<(Category, String)>,
    /// Issued tokens keyed by `(category, value)`.
    forward: HashMap<(Category, String), String>,
    reverse: HashMap<String, VaultEntry>,
    counters: BTreeMap<Category, u32>,
}

impl Vault {
    /// Create an empty vault relying on pattern detection only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vault that also redacts the given structured values wherever
    /// they occur verbatim. Known values take priority over pattern matches.
    pub fn with_known_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (Category, String)>,
    {
        let mut known: Vec<(Category, String)> = values
            .into_iter()
            .map(|(category, value)| (category, value.trim().to_owned()))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        // Longest first so "Ravi Kumar" wins over "Ravi".
        known.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        Self {
            known,
            ..Self::default()
        }
    }

    /// Number of distinct values mapped so far.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether no value has been mapped yet.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Real value for an issued token.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        self.reverse.get(token).map(|e| e.real_value.as_str())
    }

    /// Replace every detected sensitive value in `text` with a stable token.
    pub fn tokenize(&mut self, text: &str) -> Tokenized {
        let spans = self.detect(text);
        let mut out = String::with_capacity(text.len());
        let mut added = Vec::new();
        let mut cursor = 0;

        for span in spans {
            let gap = text.get(cursor..span.start);
            let value = text.get(span.start..span.end);
            let (Some(gap), Some(value)) = (gap, value) else {
                continue;
            };
            out.push_str(gap);
            let (token, fresh) = self.token_for(value, span.category);
            if let Some(entry) = fresh {
                added.push(entry);
            }
            out.push_str(&token);
            cursor = span.end;
        }
        out.push_str(text.get(cursor..).unwrap_or_default());

        Tokenized { text: out, added }
    }

    /// Replace every token in `text` with its real value.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnknownToken`] for the first token not issued by
    /// this vault. Nothing is substituted on error.
    pub fn rehydrate(&self, text: &str) -> Result<String, VaultError> {
        let Some(token_re) = token_pattern() else {
            return Ok(text.to_owned());
        };

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for m in token_re.find_iter(text) {
            let entry = self
                .reverse
                .get(m.as_str())
                .ok_or_else(|| VaultError::UnknownToken {
                    token: m.as_str().to_owned(),
                })?;
            out.push_str(text.get(cursor..m.start()).unwrap_or_default());
            out.push_str(&entry.real_value);
            cursor = m.end();
        }
        out.push_str(text.get(cursor..).unwrap_or_default());
        Ok(out)
    }

    /// Recursively rehydrate every string inside a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::UnknownToken`] if any string holds an unknown token.
    pub fn rehydrate_value(&self, value: &Value) -> Result<Value, VaultError> {
        let restored = match value {
            Value::String(s) => Value::String(self.rehydrate(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.rehydrate_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut restored = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    restored.insert(key.clone(), self.rehydrate_value(item)?);
                }
                Value::Object(restored)
            }
            other => other.clone(),
        };
        Ok(restored)
    }

    /// Return the token for `value`, issuing a new one on first sight.
    fn token_for(&mut self, value: &str, category: Category) -> (String, Option<VaultEntry>) {
        let key = (category, value.trim().to_owned());
        if let Some(token) = self.forward.get(&key) {
            return (token.clone(), None);
        }

        let counter = self.counters.entry(category).or_insert(0);
        *counter = counter.saturating_add(1);
        let token = format!("[REF_{}_{}]", category.label(), counter);
        let entry = VaultEntry {
            real_value: key.1.clone(),
            token: token.clone(),
            category,
        };
        self.forward.insert(key, token.clone());
        self.reverse.insert(token.clone(), entry.clone());
        (token, Some(entry))
    }

    /// Locate non-overlapping sensitive spans, sorted by start offset.
    fn detect(&self, text: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = Vec::new();

        for (category, value) in &self.known {
            for (start, _) in text.match_indices(value.as_str()) {
                let end = start.saturating_add(value.len());
                if is_isolated(text, start, end) {
                    claim(&mut spans, Span { start, end, category: *category });
                }
            }
        }

        for pattern in default_patterns() {
            for (start, end) in pattern.find_spans(text) {
                let span = trim_span(text, start, end, pattern.category);
                if span.start < span.end {
                    claim(&mut spans, span);
                }
            }
        }

        spans.sort_by_key(|s| s.start);
        spans
    }
}

/// Keep `candidate` unless it overlaps an already-claimed span.
fn claim(spans: &mut Vec<Span>, candidate: Span) {
    let overlaps = spans
        .iter()
        .any(|s| candidate.start < s.end && s.start < candidate.end);
    if !overlaps {
        spans.push(candidate);
    }
}

/// Shrink a span so it does not start or end on whitespace or separators.
fn trim_span(text: &str, start: usize, end: usize, category: Category) -> Span {
    let slice = text.get(start..end).unwrap_or_default();
    let trimmed_start = slice.trim_start_matches(|c: char| c.is_whitespace() || c == '-');
    let lead = slice.len().saturating_sub(trimmed_start.len());
    let trimmed = trimmed_start.trim_end_matches(|c: char| c.is_whitespace() || c == '-');
    let new_start = start.saturating_add(lead);
    Span {
        start: new_start,
        end: new_start.saturating_add(trimmed.len()),
        category,
    }
}
