use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use relay_types::{ConversationId, PermissionMode, RuleScope};

use crate::permissions::{CapabilityTable, PermissionRule, RuleParseError, RuleSetOracle};
use crate::retry::RetryConfig;

const DEFAULT_CONVERSATION_ID: &str = "default";
const DEFAULT_CANCEL_TIMEOUT_SECS: u64 = 30;

// Default value function for serde (bool::default() is false, so only true needs a fn)
pub(crate) const fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayConfig {
    pub session: Option<SessionConfig>,
    pub retry: Option<RetrySection>,
    pub cancel: Option<CancelConfig>,
    pub permissions: Option<PermissionsConfig>,
    pub notifications: Option<NotificationsConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error(transparent)]
    Rule(#[from] RuleParseError),
}

impl ConfigError {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::Invalid { .. } | ConfigError::Rule(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    /// Conversation to resume. Supports `${VAR}` expansion.
    pub conversation_id: Option<String>,
    /// Whether a person is watching the terminal. Unattended sessions ring
    /// the bell when a turn ends or needs approval.
    #[serde(default = "default_true")]
    pub attended: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrySection {
    pub llm_max_attempts: Option<u32>,
    pub llm_base_delay_ms: Option<u64>,
    pub busy_delay_ms: Option<u64>,
    pub busy_max_retries: Option<u32>,
    pub desync_max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelConfig {
    /// Force-abort a turn this long after a graceful cancel was requested.
    pub safety_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PermissionsConfig {
    /// `default`, `acceptEdits`, `plan` or `bypassPermissions`.
    pub mode: Option<String>,
    /// Tools that always need a human decision.
    #[serde(default)]
    pub always_ask: Vec<String>,
    /// Tools without side effects (run concurrently, allowed in plan mode).
    #[serde(default)]
    pub read_only: Vec<String>,
    /// Rules like `Bash(git status)` or `Read`.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub bell: bool,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { bell: true }
    }
}

/// Runtime settings resolved from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub conversation_id: ConversationId,
    pub retry: RetryConfig,
    pub cancel_timeout: Duration,
    pub permission_mode: PermissionMode,
    pub attended: bool,
    pub bell: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            conversation_id: ConversationId::new(DEFAULT_CONVERSATION_ID),
            retry: RetryConfig::default(),
            cancel_timeout: Duration::from_secs(DEFAULT_CANCEL_TIMEOUT_SECS),
            permission_mode: PermissionMode::Default,
            attended: true,
            bell: true,
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".relay").join("config.toml"))
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl RelayConfig {
    /// Load `~/.relay/config.toml`. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = match config_path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    pub fn settings(&self) -> Result<OrchestratorSettings, ConfigError> {
        let defaults = OrchestratorSettings::default();
        let retry_defaults = defaults.retry.clone();

        let conversation_id = self
            .session
            .as_ref()
            .and_then(|s| s.conversation_id.as_deref())
            .map(expand_env_vars)
            .filter(|id| !id.trim().is_empty())
            .map_or(defaults.conversation_id, ConversationId::new);

        let retry = match &self.retry {
            Some(section) => RetryConfig {
                llm_max_attempts: section
                    .llm_max_attempts
                    .unwrap_or(retry_defaults.llm_max_attempts),
                llm_base_delay: section
                    .llm_base_delay_ms
                    .map_or(retry_defaults.llm_base_delay, Duration::from_millis),
                busy_delay: section
                    .busy_delay_ms
                    .map_or(retry_defaults.busy_delay, Duration::from_millis),
                busy_max_retries: section
                    .busy_max_retries
                    .unwrap_or(retry_defaults.busy_max_retries),
                desync_max_attempts: section
                    .desync_max_attempts
                    .unwrap_or(retry_defaults.desync_max_attempts),
            },
            None => retry_defaults,
        };

        let cancel_timeout = match self.cancel.as_ref().and_then(|c| c.safety_timeout_secs) {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "cancel.safety_timeout_secs",
                    message: "must be greater than zero".to_string(),
                });
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.cancel_timeout,
        };

        let permission_mode = match self.permissions.as_ref().and_then(|p| p.mode.as_deref()) {
            Some(raw) => PermissionMode::parse(raw).ok_or_else(|| ConfigError::Invalid {
                field: "permissions.mode",
                message: format!(
                    "unknown mode '{raw}' (expected one of: {})",
                    PermissionMode::ALL.map(PermissionMode::as_str).join(", ")
                ),
            })?,
            None => defaults.permission_mode,
        };

        Ok(OrchestratorSettings {
            conversation_id,
            retry,
            cancel_timeout,
            permission_mode,
            attended: self.session.as_ref().is_none_or(|s| s.attended),
            bell: self.notifications.as_ref().is_none_or(|n| n.bell),
        })
    }

    /// The standard capability table with config overrides applied.
    #[must_use]
    pub fn capability_table(&self) -> CapabilityTable {
        let mut table = CapabilityTable::standard();
        if let Some(permissions) = &self.permissions {
            for tool in &permissions.read_only {
                table.mark_read_only(tool.trim());
            }
            for tool in &permissions.always_ask {
                table.mark_always_ask(tool.trim());
            }
        }
        table
    }

    /// Rule store seeded with the configured allow and deny rules.
    pub fn rule_set_oracle(&self, table: CapabilityTable) -> Result<RuleSetOracle, ConfigError> {
        let mut oracle = RuleSetOracle::new(table);
        if let Some(permissions) = &self.permissions {
            for raw in &permissions.allow {
                oracle = oracle.with_allow(PermissionRule::parse(raw)?, RuleScope::User);
            }
            for raw in &permissions.deny {
                oracle = oracle.with_deny(PermissionRule::parse(raw)?, RuleScope::User);
            }
        }
        Ok(oracle)
    }
}
