pub mod injection;
pub mod redaction;
pub mod threat;

use serde::{Deserialize, Serialize};

/// Severity tiers shared by the injection guard and the threat analyzer.
/// Ordering matters: escalation and blocking decisions compare tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Benign,
    Suspicious,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Benign => "benign",
            Severity::Suspicious => "suspicious",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// The next tier up, saturating at `Critical`.
    pub fn escalated(self) -> Severity {
        match self {
            Severity::Benign => Severity::Suspicious,
            Severity::Suspicious => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_tiers() {
        assert!(Severity::Benign < Severity::Suspicious);
        assert!(Severity::Suspicious < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn escalation_saturates_at_critical() {
        assert_eq!(Severity::Benign.escalated(), Severity::Suspicious);
        assert_eq!(Severity::Critical.escalated(), Severity::Critical);
    }
}
