use std::sync::LazyLock;

use regex::Regex;

use super::Severity;

/// A single entry in the fixed injection ruleset.
struct InjectionRule {
    name: &'static str,
    severity: Severity,
    pattern: &'static str,
}

const RULES: &[InjectionRule] = &[
    InjectionRule {
        name: "instruction_override",
        severity: Severity::Critical,
        pattern: r"(?i)\b(?:ignore|disregard|forget)\s+(?:all\s+|any\s+)?(?:previous|prior|preceding|above|earlier)\s+(?:instructions?|directives?|rules?|prompts?)",
    },
    InjectionRule {
        name: "system_prompt_exfiltration",
        severity: Severity::Critical,
        pattern: r"(?i)\b(?:reveal|print|repeat|output|show|dump)\b.{0,40}\bsystem\s+prompt\b",
    },
    InjectionRule {
        name: "guard_removal",
        severity: Severity::Critical,
        pattern: r"(?i)\byou\s+are\s+(?:now\s+)?(?:free|no\s+longer\s+bound|unrestricted|without\s+(?:any\s+)?(?:limits|restrictions|filters))\b",
    },
    InjectionRule {
        name: "instruction_injection",
        severity: Severity::High,
        pattern: r"(?i)\bnew\s+(?:system\s+)?instructions?\s*:",
    },
    InjectionRule {
        name: "developer_mode",
        severity: Severity::High,
        pattern: r"(?i)\b(?:developer|debug|god)\s+mode\b",
    },
    InjectionRule {
        name: "conversation_reset",
        severity: Severity::High,
        pattern: r"(?i)\b(?:start|begin)\s+(?:a\s+)?(?:new|fresh)\s+(?:session|context)\s+(?:as|with\s+no)\b",
    },
    InjectionRule {
        name: "instruction_probe",
        severity: Severity::Suspicious,
        pattern: r"(?i)\bwhat\s+(?:are|were)\s+your\s+(?:original\s+)?(?:instructions|rules|guidelines)\b",
    },
    InjectionRule {
        name: "encoded_payload",
        severity: Severity::Suspicious,
        pattern: r"(?i)\b(?:decode|execute|run)\s+(?:this\s+)?(?:base64|rot13|hex)\b",
    },
    InjectionRule {
        name: "delimiter_flood",
        severity: Severity::Suspicious,
        pattern: r"(?:[-=#*]{12,}|`{6,})",
    },
    InjectionRule {
        name: "persona_request",
        severity: Severity::Benign,
        pattern: r"(?i)\b(?:pretend|act\s+as|roleplay)\b",
    },
];

static COMPILED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| Regex::new(rule.pattern).unwrap_or_else(|e| panic!("bad rule {}: {e}", rule.name)))
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub name: String,
    pub severity: Severity,
}

/// Result of screening one prompt against the fixed ruleset.
#[derive(Debug, Clone)]
pub struct InjectionAnalysis {
    pub is_clean: bool,
    pub detected_patterns: Vec<PatternMatch>,
    pub sanitized_text: String,
    pub requires_user_confirmation: bool,
}

impl InjectionAnalysis {
    pub fn max_severity(&self) -> Option<Severity> {
        self.detected_patterns.iter().map(|m| m.severity).max()
    }
}

/// Stateless heuristic classifier for prompt-injection risk.
///
/// Screening is synchronous and pure: the same text always yields the same
/// analysis. Escalation across turns lives in
/// [`ThreatAnalyzer`](crate::security::threat::ThreatAnalyzer) instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct InjectionGuard;

impl InjectionGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str) -> InjectionAnalysis {
        let mut detected = Vec::new();
        let mut sanitized = text.to_string();

        for (rule, regex) in RULES.iter().zip(COMPILED.iter()) {
            if regex.is_match(text) {
                detected.push(PatternMatch {
                    name: rule.name.to_string(),
                    severity: rule.severity,
                });
                if rule.severity >= Severity::High {
                    sanitized = regex.replace_all(&sanitized, "[filtered]").into_owned();
                }
            }
        }

        let max = detected.iter().map(|m| m.severity).max();
        InjectionAnalysis {
            is_clean: detected.is_empty(),
            requires_user_confirmation: max == Some(Severity::High),
            sanitized_text: sanitized,
            detected_patterns: detected,
        }
    }

    /// True iff any matched pattern is critical-severity.
    pub fn should_block(&self, analysis: &InjectionAnalysis) -> bool {
        analysis
            .detected_patterns
            .iter()
            .any(|m| m.severity == Severity::Critical)
    }
}
