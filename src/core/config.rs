use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::redaction::CustomPattern;
use crate::security::threat::ThreatPolicy;
use crate::tools::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no project config directory available on this platform")]
    NoProjectDirs,
}

/// Security screening knobs for the send pipeline. `injection_check` and
/// `threat_analysis` gate the respective stages entirely; the threat policy
/// tunes how detections are acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub injection_check: bool,
    pub threat_analysis: bool,
    pub threat_policy: ThreatPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            injection_check: true,
            threat_analysis: true,
            threat_policy: ThreatPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    /// How many trailing history messages are redacted per send.
    pub history_window: usize,
    pub disabled_builtins: Vec<String>,
    pub custom_patterns: Vec<CustomPattern>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_window: 12,
            disabled_builtins: Vec::new(),
            custom_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,
    /// Backend names to fan out to. Parallel mode is active only when
    /// `enabled` is set and this list is non-empty.
    pub providers: Vec<String>,
}

impl ParallelConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.providers.is_empty()
    }
}

/// A predefined skill: extra system-prompt content appended for one call
/// when the outgoing message matches a trigger phrase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillDefinition {
    pub name: String,
    pub triggers: Vec<String>,
    pub prompt: String,
}

impl SkillDefinition {
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.triggers
            .iter()
            .any(|trigger| !trigger.is_empty() && lower.contains(&trigger.to_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Name of the backend used for single-backend sends.
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub security: SecurityConfig,
    pub redaction: RedactionConfig,
    pub retry: RetryPolicy,
    pub parallel: ParallelConfig,
    pub skills: Vec<SkillDefinition>,
    pub memory_extraction: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: "default".to_string(),
            model: String::new(),
            system_prompt: None,
            temperature: None,
            security: SecurityConfig::default(),
            redaction: RedactionConfig::default(),
            retry: RetryPolicy::default(),
            parallel: ParallelConfig::default(),
            skills: Vec::new(),
            memory_extraction: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("org", "permacommons", "colloquy")
            .ok_or(ConfigError::NoProjectDirs)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from the platform config directory; a missing file yields the
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&Self::default_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// First skill whose trigger matches the outgoing text.
    pub fn match_skill(&self, text: &str) -> Option<&SkillDefinition> {
        self.skills.iter().find(|skill| skill.matches(text))
    }
}
