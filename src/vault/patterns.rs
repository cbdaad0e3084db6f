//! PII detection patterns, ordered from most to least specific.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// PII category attached to every vault entry.
///
/// The upper-case label is embedded in issued tokens, e.g. `[REF_PHONE_1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Customer or agent name supplied as a structured field.
    Person,
    /// Credit or debit card number.
    CreditCard,
    /// US social security number.
    Ssn,
    /// Indian Aadhaar number.
    Aadhaar,
    /// Indian PAN.
    Pan,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Case, ticket or reference identifier (`PREFIX-DIGITS`).
    CaseId,
}

impl Category {
    /// Token label for this category.
    pub fn label(self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::CreditCard => "CREDIT_CARD",
            Self::Ssn => "SSN",
            Self::Aadhaar => "AADHAAR",
            Self::Pan => "PAN",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::CaseId => "CASE_ID",
        }
    }

    /// Parse a token label back into a category.
    pub fn from_label(label: &str) -> Option<Self> {
        let category = match label {
            "PERSON" => Self::Person,
            "CREDIT_CARD" => Self::CreditCard,
            "SSN" => Self::Ssn,
            "AADHAAR" => Self::Aadhaar,
            "PAN" => Self::Pan,
            "EMAIL" => Self::Email,
            "PHONE" => Self::Phone,
            "CASE_ID" => Self::CaseId,
            _ => return None,
        };
        Some(category)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A compiled detection pattern paired with its category.
#[derive(Debug)]
pub struct PiiPattern {
    /// Category assigned to every match.
    pub category: Category,
    /// Compiled expression.
    pub regex: Regex,
    /// Reject matches touching a word character on either side.
    ///
    /// The `regex` crate has no look-around, so patterns that start or end
    /// with optional punctuation enforce their boundary here instead.
    pub isolated: bool,
}

impl PiiPattern {
    /// Accepted `(start, end)` byte ranges in `text`, left to right.
    pub fn find_spans(&self, text: &str) -> Vec<(usize, usize)> {
        if !self.isolated {
            return self
                .regex
                .find_iter(text)
                .map(|m| (m.start(), m.end()))
                .collect();
        }

        let mut spans = Vec::new();
        let mut pos = 0;
        while let Some(m) = self.regex.find_at(text, pos) {
            if is_isolated(text, m.start(), m.end()) {
                spans.push((m.start(), m.end()));
                pos = m.end();
            } else {
                // Retry from the next character so a shorter, isolated match is not lost.
                pos = next_char_boundary(text, m.start());
            }
            if pos >= text.len() {
                break;
            }
        }
        spans
    }
}

/// Whether `text[start..end]` is not glued to surrounding word characters.
pub fn is_isolated(text: &str, start: usize, end: usize) -> bool {
    let before = text.get(..start).and_then(|s| s.chars().next_back());
    let after = text.get(end..).and_then(|s| s.chars().next());
    !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
}

fn next_char_boundary(text: &str, index: usize) -> usize {
    text.get(index..)
        .and_then(|rest| rest.chars().next())
        .map_or(text.len(), |c| index.saturating_add(c.len_utf8()))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Default detection table, compiled once.
pub fn default_patterns() -> &'static [PiiPattern] {
    static PATTERNS: OnceLock<Vec<PiiPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(Category, &str, bool); 7] = [
            (Category::CreditCard, r"\b(?:\d[ -]*?){13,19}\b", false),
            (Category::Ssn, r"\b\d{3}[-.\s]\d{2}[-.\s]\d{4}\b", false),
            (Category::Aadhaar, r"\b\d{4}\s?\d{4}\s?\d{4}\b", false),
            (Category::Pan, r"\b[A-Z]{5}\d{4}[A-Z]\b", false),
            (
                Category::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                false,
            ),
            (
                Category::Phone,
                r"(?:\+?\d{1,3}[-.\s]?)?\d{5}[-.\s]\d{5}|(?:\+?\d{1,3}[-.\s]?)?(?:\(?\d{2,5}\)?[-.\s]?)?\d{3,5}[-.\s]?\d{4}",
                true,
            ),
            (Category::CaseId, r"\b[A-Z]{2,5}-\d{3,10}\b", false),
        ];

        table
            .iter()
            .filter_map(|&(category, pattern, isolated)| {
                Regex::new(pattern).ok().map(|regex| PiiPattern {
                    category,
                    regex,
                    isolated,
                })
            })
            .collect()
    })
}

/// Matches any token shaped like one this crate issues, e.g. `[REF_CASE_ID_3]`.
pub fn token_pattern() -> Option<&'static Regex> {
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
    TOKEN
        .get_or_init(|| Regex::new(r"\[REF_([A-Z]+(?:_[A-Z]+)*)_(\d+)\]").ok())
        .as_ref()
}
