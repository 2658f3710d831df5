//! Agent profiles: read-only execution settings keyed by agent type.
//!
//! Loaded once at startup from a JSON file holding an array of profiles:
//!
//! ```json
//! [
//!   { "agentType": "editor", "name": "Gianni", "persona": "You are a careful editor.",
//!     "command": ["claude", "-p"], "timeoutSecs": 600 }
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Identity and behavior of one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub agent_type: String,
    /// Display name used in the prompt.
    pub name: String,
    /// Persona / system instructions prepended to every prompt.
    #[serde(default)]
    pub persona: String,
    /// Program and arguments overriding the default subprocess command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl AgentProfile {
    pub fn new(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            name: name.into(),
            persona: String::new(),
            command: None,
            timeout_secs: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Per-profile timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Lookup of agent profiles by type.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    /// Load profiles from a JSON file. A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "Agent profile file not found, no task will be dispatchable"
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let profiles: Vec<AgentProfile> = serde_json::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("agent profiles in {}: {e}", path.display()))
        })?;
        let registry = Self::from_profiles(profiles)?;
        info!(path = %path.display(), count = registry.len(), "Loaded agent profiles");
        Ok(registry)
    }

    /// Build a registry, rejecting profiles without a type, with an empty
    /// command or with a zero timeout.
    pub fn from_profiles(profiles: Vec<AgentProfile>) -> Result<Self, ConfigError> {
        let mut map = HashMap::new();
        for mut profile in profiles {
            profile.agent_type = profile.agent_type.trim().to_string();
            if profile.agent_type.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "agentType".into(),
                    message: format!("profile '{}' has no agent type", profile.name),
                });
            }
            if matches!(profile.command, Some(ref c) if c.is_empty()) {
                return Err(ConfigError::InvalidValue {
                    key: "command".into(),
                    message: format!("profile '{}' has an empty command", profile.agent_type),
                });
            }
            if profile.timeout_secs == Some(0) {
                return Err(ConfigError::InvalidValue {
                    key: "timeoutSecs".into(),
                    message: format!(
                        "profile '{}' timeout must be at least one second",
                        profile.agent_type
                    ),
                });
            }
            if let Some(prev) = map.insert(profile.agent_type.clone(), profile) {
                warn!(agent_type = %prev.agent_type, "Duplicate agent profile, last one wins");
            }
        }
        Ok(Self { profiles: map })
    }

    pub fn get(&self, agent_type: &str) -> Option<&AgentProfile> {
        self.profiles.get(agent_type.trim())
    }

    /// Longest per-profile timeout override, if any profile sets one.
    pub fn longest_timeout(&self) -> Option<Duration> {
        self.profiles.values().filter_map(AgentProfile::timeout).max()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
