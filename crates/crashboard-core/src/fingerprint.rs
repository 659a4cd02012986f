//! Near-duplicate fingerprinting of crash reports.
//!
//! A report is reduced to its set of whitespace-separated tokens. The first
//! `token_limit` distinct tokens, in first-seen order, are hashed and folded
//! together with XOR, so reports that differ only in layout, line endings or
//! token repetition share a fingerprint.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_TOKEN_LIMIT: usize = 512;

/// Identity of a logical crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Computes report fingerprints with a fixed token limit.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    token_limit: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LIMIT)
    }
}

impl Fingerprinter {
    pub fn new(token_limit: usize) -> Self {
        Self { token_limit }
    }

    /// Fingerprint of `text`, or `None` when there is no text or it holds no
    /// tokens.
    pub fn fingerprint(&self, text: Option<&str>) -> Option<Fingerprint> {
        let tokens = distinct_tokens(text?);
        if tokens.is_empty() {
            return None;
        }

        let folded = tokens
            .iter()
            .take(self.token_limit)
            .fold(0u64, |acc, token| acc ^ token_hash(token));
        Some(Fingerprint(folded))
    }
}

/// Shorthand for [`Fingerprinter::fingerprint`] with the default limit.
pub fn fingerprint(text: &str) -> Option<Fingerprint> {
    Fingerprinter::default().fingerprint(Some(text))
}

// First-seen order keeps the truncated token set identical across runs.
fn distinct_tokens(text: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    text.lines()
        .flat_map(str::split_whitespace)
        .filter(|token| !token.is_empty())
        .filter(|token| seen.insert(*token))
        .collect()
}

fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
