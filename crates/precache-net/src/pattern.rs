//! Regex URL patterns for ignore lists and navigation whitelists.

use fancy_regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A pattern failed to compile.
#[derive(Error, Debug)]
#[error("Invalid pattern `{pattern}`: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: Box<fancy_regex::Error>,
}

/// A compiled regular expression tested against some part of a URL.
///
/// Serializes as its source string, so configs can list patterns as plain
/// JSON strings.
#[derive(Clone)]
pub struct UrlPattern {
    regex: Regex,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Regex::new(pattern)
            .map(|regex| Self { regex })
            .map_err(|source| PatternError {
                pattern: pattern.to_string(),
                source: Box::new(source),
            })
    }

    /// Source text of the pattern.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Unanchored search, the way `String.prototype.match` behaves.
    ///
    /// A pattern that exceeds the backtracking limit counts as no match.
    pub fn matches(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack).unwrap_or(false)
    }

    /// True if any pattern in `patterns` matches.
    pub fn any_match(patterns: &[UrlPattern], haystack: &str) -> bool {
        patterns.iter().any(|p| p.matches(haystack))
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UrlPattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl FromStr for UrlPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for UrlPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::new(&source).map_err(serde::de::Error::custom)
    }
}
