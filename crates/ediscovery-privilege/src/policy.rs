//! Privilege policy: a plain-text rule file compiled once into an opaque,
//! immutable byte buffer plus a derived `RegexSet` — no runtime reflection
//! (Design Note §9, "dynamic policy objects").
//!
//! Rule line grammar (blank lines and `#`-comments ignored):
//!
//! ```text
//! LABEL | KIND | PATTERN [| WEIGHT]
//! ```
//!
//! `KIND` is one of `domain`, `phrase`, `pattern`, `nonprivileged`.
//! `domain` and `phrase` are case-insensitive literal matches (escaped
//! before compiling); `pattern` is a raw regex the policy author controls
//! case-sensitivity for; `nonprivileged` marks a rule that, alone, makes the
//! document conclusively non-privileged regardless of any other match.
//! `WEIGHT` defaults to `0.9` and is the amount a match contributes to its
//! label's confidence (summed across matching rules for that label, capped
//! at `1.0`).

use std::path::Path;

use regex::RegexSet;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy file unavailable: {0}")]
    Missing(String),
    #[error("malformed policy line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("invalid pattern on policy line {line}: {source}")]
    InvalidPattern {
        line: usize,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Pattern,
    Domain,
    Phrase,
    NonPrivileged,
}

struct CompiledRule {
    label: String,
    kind: RuleKind,
    weight: f64,
}

/// Result of running [`Policy::scan`] over a document's extracted text.
#[derive(Debug, Clone, Default)]
pub struct Stage1Result {
    /// Labels matched, sorted, each with cumulative weight `>= 0`.
    pub labels: Vec<String>,
    /// `max` over matched labels' cumulative weight; `0.0` if none matched.
    pub confidence: f64,
    /// `true` if a `nonprivileged` rule matched.
    pub nonprivileged: bool,
}

/// A compiled, immutable policy. `version` is `SHA-256(raw policy bytes)`
/// (§4.8, "Policy management"): policies are immutable once hashed, and
/// every decision records the version that produced it.
pub struct Policy {
    version: String,
    text: String,
    rules: Vec<CompiledRule>,
    set: RegexSet,
}

impl Policy {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Missing(format!("{}: {e}", path.display())))?;
        Self::compile(text)
    }

    pub fn compile(text: String) -> Result<Self, PolicyError> {
        let version = hex::encode(Sha256::digest(text.as_bytes()));

        let mut patterns = Vec::new();
        let mut rules = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            if parts.len() < 3 {
                return Err(PolicyError::Malformed {
                    line: line_no,
                    reason: "expected 'LABEL | KIND | PATTERN [| WEIGHT]'".to_string(),
                });
            }

            let label = parts[0].to_string();
            let kind = match parts[1].to_ascii_lowercase().as_str() {
                "pattern" => RuleKind::Pattern,
                "domain" => RuleKind::Domain,
                "phrase" => RuleKind::Phrase,
                "nonprivileged" => RuleKind::NonPrivileged,
                other => {
                    return Err(PolicyError::Malformed {
                        line: line_no,
                        reason: format!("unknown rule kind '{other}'"),
                    })
                }
            };
            let raw_pattern = parts[2];
            let weight: f64 = if parts.len() >= 4 {
                parts[3].parse().map_err(|_| PolicyError::Malformed {
                    line: line_no,
                    reason: "weight must be a float".to_string(),
                })?
            } else {
                0.9
            };

            let regex_source = match kind {
                RuleKind::Domain => format!("(?i)@{}\\b", regex::escape(raw_pattern)),
                RuleKind::Phrase => format!("(?i){}", regex::escape(raw_pattern)),
                RuleKind::Pattern | RuleKind::NonPrivileged => raw_pattern.to_string(),
            };
            regex::Regex::new(&regex_source)
                .map_err(|e| PolicyError::InvalidPattern { line: line_no, source: e })?;

            patterns.push(regex_source);
            rules.push(CompiledRule { label, kind, weight });
        }

        let set = RegexSet::new(&patterns).map_err(|e| PolicyError::Malformed {
            line: 0,
            reason: e.to_string(),
        })?;

        Ok(Self { version, text, rules, set })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Stage 1 pattern pre-filter (§4.8): deterministic, offline, no
    /// network. Every rule that matches `text` contributes its weight to
    /// its label's cumulative score.
    pub fn scan(&self, text: &str) -> Stage1Result {
        let matched = self.set.matches(text);
        let mut scores: std::collections::BTreeMap<String, f64> = std::collections::BTreeMap::new();
        let mut nonprivileged = false;

        for idx in matched.iter() {
            let rule = &self.rules[idx];
            if rule.kind == RuleKind::NonPrivileged {
                nonprivileged = true;
                continue;
            }
            let entry = scores.entry(rule.label.clone()).or_insert(0.0);
            *entry = (*entry + rule.weight).min(1.0);
        }

        let mut labels: Vec<String> = scores.keys().cloned().collect();
        labels.sort();
        let confidence = scores.values().cloned().fold(0.0_f64, f64::max);

        Stage1Result { labels, confidence, nonprivileged }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "\
# attorney-client privilege
PRIVILEGED:ACP | domain | lawfirm.com | 0.6
PRIVILEGED:ACP | phrase | privileged and confidential | 0.5
PRIVILEGED:WP | phrase | attorney work product | 0.9
RESPONSIVE | nonprivileged | public filing | 1.0
";

    #[test]
    fn version_is_sha256_of_raw_text() {
        let policy = Policy::compile(POLICY.to_string()).unwrap();
        let expected = hex::encode(Sha256::digest(POLICY.as_bytes()));
        assert_eq!(policy.version(), expected);
    }

    #[test]
    fn domain_and_phrase_rules_accumulate_confidence() {
        let policy = Policy::compile(POLICY.to_string()).unwrap();
        let result = policy.scan("From: counsel@lawfirm.com\n\nThis is privileged and confidential.");
        assert_eq!(result.labels, vec!["PRIVILEGED:ACP".to_string()]);
        assert!(result.confidence >= 0.85, "confidence was {}", result.confidence);
        assert!(!result.nonprivileged);
    }

    #[test]
    fn nonprivileged_marker_is_reported() {
        let policy = Policy::compile(POLICY.to_string()).unwrap();
        let result = policy.scan("This is a public filing with the SEC.");
        assert!(result.nonprivileged);
        assert!(result.labels.is_empty());
    }

    #[test]
    fn unmatched_text_yields_zero_confidence() {
        let policy = Policy::compile(POLICY.to_string()).unwrap();
        let result = policy.scan("Just an ordinary business memo.");
        assert_eq!(result.confidence, 0.0);
        assert!(result.labels.is_empty());
        assert!(!result.nonprivileged);
    }

    #[test]
    fn malformed_line_is_rejected() {
        let err = Policy::compile("NOT ENOUGH FIELDS".to_string()).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { line: 1, .. }));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Policy::compile("L | bogus | x".to_string()).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { .. }));
    }
}
