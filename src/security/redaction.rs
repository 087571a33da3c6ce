use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Built-in patterns, ordered so that broader matches (cards, keys) run
/// before narrower ones that could nibble at their substrings.
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (
        "private_key_block",
        r"-----BEGIN\s+(?:RSA\s+|EC\s+|OPENSSH\s+)?PRIVATE\s+KEY-----[\s\S]*?-----END\s+(?:RSA\s+|EC\s+|OPENSSH\s+)?PRIVATE\s+KEY-----",
    ),
    ("aws_access_key", r"\bAKIA[0-9A-Z]{16}\b"),
    ("api_key", r"\b(?:sk|pk|rk)-[A-Za-z0-9]{16,}\b"),
    ("bearer_token", r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{16,}"),
    ("credit_card", r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b"),
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    ("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
];

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("pattern `{0}` already exists")]
    Duplicate(String),
    #[error("pattern `{0}` not found")]
    NotFound(String),
    #[error("built-in pattern `{0}` cannot be removed (disable it instead)")]
    Builtin(String),
    #[error("invalid regex for pattern `{name}`: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// A user-defined pattern as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    name: String,
    regex: Regex,
    enabled: bool,
    builtin: bool,
}

/// Summary row for listing patterns to an embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternInfo {
    pub name: String,
    pub enabled: bool,
    pub builtin: bool,
}

/// Result of one redaction pass. The map lives exactly one exchange: the
/// orchestrator captures it at send time and drops it when the exchange
/// finishes.
#[derive(Debug, Clone, Default)]
pub struct RedactionResult {
    pub sanitized_text: String,
    /// placeholder -> original value
    pub redaction_map: HashMap<String, String>,
    pub detected_patterns: Vec<String>,
}

/// Reversible sensitive-data substitution.
///
/// Placeholders take the form `[[NAME#n]]`. Identical matched values within
/// one text share a placeholder, so `redact` followed by [`restore`] is the
/// identity for any input that does not itself contain literal placeholder
/// syntax.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<CompiledPattern>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        let patterns = BUILTIN_PATTERNS
            .iter()
            .map(|(name, pattern)| CompiledPattern {
                name: (*name).to_string(),
                regex: Regex::new(pattern)
                    .unwrap_or_else(|e| panic!("bad builtin pattern {name}: {e}")),
                enabled: true,
                builtin: true,
            })
            .collect();
        Self { patterns }
    }

    /// Build a redactor from configuration: disabled built-ins plus custom
    /// patterns. Invalid custom regexes are rejected, not skipped.
    pub fn from_config(
        disabled_builtins: &[String],
        custom: &[CustomPattern],
    ) -> Result<Self, RedactionError> {
        let mut redactor = Self::new();
        for name in disabled_builtins {
            redactor.set_enabled(name, false)?;
        }
        for pattern in custom {
            redactor.add_pattern(&pattern.name, &pattern.pattern)?;
        }
        Ok(redactor)
    }

    pub fn patterns(&self) -> Vec<PatternInfo> {
        self.patterns
            .iter()
            .map(|p| PatternInfo {
                name: p.name.clone(),
                enabled: p.enabled,
                builtin: p.builtin,
            })
            .collect()
    }

    /// Toggle any pattern, built-in or custom.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), RedactionError> {
        let pattern = self
            .patterns
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| RedactionError::NotFound(name.to_string()))?;
        pattern.enabled = enabled;
        Ok(())
    }

    pub fn add_pattern(&mut self, name: &str, pattern: &str) -> Result<(), RedactionError> {
        if self.patterns.iter().any(|p| p.name == name) {
            return Err(RedactionError::Duplicate(name.to_string()));
        }
        let regex = Regex::new(pattern).map_err(|source| RedactionError::InvalidRegex {
            name: name.to_string(),
            source,
        })?;
        self.patterns.push(CompiledPattern {
            name: name.to_string(),
            regex,
            enabled: true,
            builtin: false,
        });
        Ok(())
    }

    pub fn update_pattern(&mut self, name: &str, pattern: &str) -> Result<(), RedactionError> {
        let entry = self
            .patterns
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| RedactionError::NotFound(name.to_string()))?;
        if entry.builtin {
            return Err(RedactionError::Builtin(name.to_string()));
        }
        entry.regex = Regex::new(pattern).map_err(|source| RedactionError::InvalidRegex {
            name: name.to_string(),
            source,
        })?;
        Ok(())
    }

    pub fn remove_pattern(&mut self, name: &str) -> Result<(), RedactionError> {
        let index = self
            .patterns
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| RedactionError::NotFound(name.to_string()))?;
        if self.patterns[index].builtin {
            return Err(RedactionError::Builtin(name.to_string()));
        }
        self.patterns.remove(index);
        Ok(())
    }

    /// Deterministic substitution pass. Patterns apply in registration
    /// order; within one text the same matched value always maps to the
    /// same placeholder.
    pub fn redact(&self, text: &str) -> RedactionResult {
        let mut sanitized = text.to_string();
        let mut map: HashMap<String, String> = HashMap::new();
        let mut detected = Vec::new();

        for pattern in self.patterns.iter().filter(|p| p.enabled) {
            if !pattern.regex.is_match(&sanitized) {
                continue;
            }
            detected.push(pattern.name.clone());

            let mut by_value: HashMap<String, String> = HashMap::new();
            let mut counter = 0usize;
            let upper = pattern.name.to_uppercase();
            sanitized = pattern
                .regex
                .replace_all(&sanitized, |caps: &regex::Captures<'_>| {
                    let original = caps[0].to_string();
                    by_value
                        .entry(original.clone())
                        .or_insert_with(|| {
                            counter += 1;
                            let placeholder = format!("[[{upper}#{counter}]]");
                            map.insert(placeholder.clone(), original);
                            placeholder
                        })
                        .clone()
                })
                .into_owned();
        }

        RedactionResult {
            sanitized_text: sanitized,
            redaction_map: map,
            detected_patterns: detected,
        }
    }
}

/// Reverse a redaction pass on arbitrary text (typically model output that
/// echoed the placeholders).
pub fn restore(text: &str, map: &HashMap<String, String>) -> String {
    let mut restored = text.to_string();
    for (placeholder, original) in map {
        restored = restored.replace(placeholder, original);
    }
    restored
}
