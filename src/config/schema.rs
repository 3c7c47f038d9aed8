use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bridge::DefaultAction;
use crate::error::ConfigError;
use crate::policy::PolicyRule;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path this config was loaded from - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub reconnection: ReconnectConfig,

    #[serde(default)]
    pub offline: OfflineConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport backend: currently "stdio"; chat backends plug in here.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Identity reported for the local operator on the stdio backend.
    #[serde(default = "default_operator_id")]
    pub operator_id: u64,
}

fn default_backend() -> String {
    "stdio".to_string()
}

fn default_operator_id() -> u64 {
    1
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            operator_id: default_operator_id(),
        }
    }
}

// ── Security ──────────────────────────────────────────────────────

/// Authorization is fail-closed: an empty allow-list denies every user
/// unless `allow_anonymous` is set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub authorized_users: Vec<u64>,
    /// DANGER: allow unauthenticated users (development only).
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Hex HMAC secret for callback signing; falls back to
    /// TETHER_CALLBACK_KEY, then an ephemeral key.
    #[serde(default)]
    pub callback_secret: Option<String>,
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub log_unauthorized_attempts: bool,
    /// Control commands the operator may inject into the agent.
    #[serde(default = "default_control_commands")]
    pub allowed_control_commands: Vec<String>,
}

fn default_redact_patterns() -> Vec<String> {
    ["password", "secret", "token", "api_key", "private_key"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_control_commands() -> Vec<String> {
    [
        "/plan", "/architect", "/implement", "/review-sprint", "/audit-sprint", "/run", "/halt",
        "/resume", "/validate",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_true() -> bool {
    true
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            authorized_users: Vec::new(),
            allow_anonymous: false,
            callback_secret: None,
            redact_patterns: default_redact_patterns(),
            log_unauthorized_attempts: true,
            allowed_control_commands: default_control_commands(),
        }
    }
}

impl SecuritySettings {
    /// Fail-closed authorization check.
    pub fn is_authorized(&self, user_id: u64) -> bool {
        if self.allow_anonymous {
            return true;
        }
        if self.authorized_users.is_empty() {
            return false;
        }
        self.authorized_users.contains(&user_id)
    }
}

// ── Timeouts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for permission requests (30s-1h).
    #[serde(default = "default_permission_timeout")]
    pub permission_timeout_seconds: u64,
    /// Action when the timeout expires.
    #[serde(default)]
    pub default_action: DefaultAction,
    /// Maximum age for callback signatures (1-60 min).
    #[serde(default = "default_callback_max_age")]
    pub callback_max_age_seconds: i64,
}

fn default_permission_timeout() -> u64 {
    300
}

fn default_callback_max_age() -> i64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            permission_timeout_seconds: default_permission_timeout(),
            default_action: DefaultAction::Deny,
            callback_max_age_seconds: default_callback_max_age(),
        }
    }
}

// ── Notifications ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notify on agent phase changes.
    #[serde(default = "default_true")]
    pub phase_transitions: bool,
    /// Notify when a policy auto-approves a request.
    #[serde(default = "default_true")]
    pub auto_approvals: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            phase_transitions: true,
            auto_approvals: true,
        }
    }
}

// ── Agent process ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command launching the wrapped agent.
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_workdir")]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            working_directory: default_workdir(),
            environment: HashMap::new(),
        }
    }
}

// ── Audit ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_audit_size")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_rotate_count")]
    pub rotate_count: usize,
    /// Hex HMAC key; falls back to TETHER_AUDIT_KEY, then an ephemeral key.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("tether-audit.jsonl")
}

fn default_audit_size() -> u64 {
    100
}

fn default_rotate_count() -> usize {
    5
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: default_audit_path(),
            max_file_size_mb: default_audit_size(),
            rotate_count: default_rotate_count(),
            key: None,
        }
    }
}

// ── Reconnection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 0 = unlimited attempts.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    300.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_attempts: 0,
            jitter: default_jitter(),
        }
    }
}

// ── Offline buffering ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    #[serde(default = "default_offline_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_offline_age")]
    pub max_event_age_seconds: i64,
}

fn default_offline_size() -> usize {
    100
}

fn default_offline_age() -> i64 {
    3600
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_offline_size(),
            max_event_age_seconds: default_offline_age(),
        }
    }
}

// ── Rate limiting ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub requests_per_minute: usize,
    #[serde(default = "default_backoff_base")]
    pub denial_backoff_base: f64,
    #[serde(default = "default_backoff_max")]
    pub denial_backoff_max: f64,
    #[serde(default = "default_denial_threshold")]
    pub denial_threshold: u32,
}

fn default_rpm() -> usize {
    30
}

fn default_backoff_base() -> f64 {
    5.0
}

fn default_backoff_max() -> f64 {
    300.0
}

fn default_denial_threshold() -> u32 {
    3
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            denial_backoff_base: default_backoff_base(),
            denial_backoff_max: default_backoff_max(),
            denial_threshold: default_denial_threshold(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load from a TOML file with whitelisted env-var expansion.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        let expanded = expand_env_vars(&raw)?;
        let mut config: Self =
            toml::from_str(&expanded).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Load the default path, or fall back to built-in defaults when no
    /// config file exists yet.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::warn!(path = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.timeouts.permission_timeout_seconds;
        if !(30..=3600).contains(&t) {
            return Err(ConfigError::Validation(format!(
                "permission_timeout_seconds must be within 30..=3600, got {t}"
            )));
        }
        let age = self.timeouts.callback_max_age_seconds;
        if !(60..=3600).contains(&age) {
            return Err(ConfigError::Validation(format!(
                "callback_max_age_seconds must be within 60..=3600, got {age}"
            )));
        }
        if !(1..=1000).contains(&self.audit.max_file_size_mb) {
            return Err(ConfigError::Validation(
                "audit.max_file_size_mb must be within 1..=1000".into(),
            ));
        }
        if !(1..=20).contains(&self.audit.rotate_count) {
            return Err(ConfigError::Validation(
                "audit.rotate_count must be within 1..=20".into(),
            ));
        }
        if !(1..=100).contains(&self.rate_limit.requests_per_minute) {
            return Err(ConfigError::Validation(
                "rate_limit.requests_per_minute must be within 1..=100".into(),
            ));
        }
        if self.security.authorized_users.is_empty() && !self.security.allow_anonymous {
            tracing::warn!(
                "authorized_users is empty and allow_anonymous is off: every remote user will be denied"
            );
        }
        Ok(())
    }
}

/// Expand `${VAR}` references, restricted to a whitelist so a config file
/// cannot exfiltrate arbitrary environment state.
fn expand_env_vars(content: &str) -> Result<String, ConfigError> {
    let context = |var: &str| -> Result<Option<String>, ConfigError> {
        if !is_allowed_env_var(var) {
            return Err(ConfigError::EnvVarNotAllowed(var.to_string()));
        }
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ => Err(ConfigError::EnvVarMissing(var.to_string())),
        }
    };
    shellexpand::env_with_context(content, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| e.cause)
}

fn is_allowed_env_var(name: &str) -> bool {
    name.starts_with("TETHER_") || matches!(name, "HOME" | "USER" | "PWD")
}

pub fn default_config_path() -> PathBuf {
    let cwd_config = PathBuf::from("tether.toml");
    if cwd_config.exists() {
        return cwd_config;
    }
    if let Some(dirs) = directories::BaseDirs::new() {
        let home_config = dirs.home_dir().join(".config/tether/tether.toml");
        if home_config.exists() {
            return home_config;
        }
    }
    cwd_config
}

/// Write a starter config template.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    const TEMPLATE: &str = r#"# Tether configuration

[transport]
backend = "stdio"

[security]
# IMPORTANT: add operator user id(s) - an empty list denies ALL users!
authorized_users = []
# DANGER: set to true only for local development
# allow_anonymous = false
redact_patterns = ["password", "secret", "token", "api_key", "private_key"]
log_unauthorized_attempts = true

[timeouts]
permission_timeout_seconds = 300
default_action = "deny"

[notifications]
phase_transitions = true
auto_approvals = true

[agent]
command = "claude"
working_directory = "."

[audit]
enabled = true
log_path = "tether-audit.jsonl"
# key is read from TETHER_AUDIT_KEY when unset

# Example policy (uncomment to enable)
# [[policies]]
# name = "auto-approve-src-files"
# enabled = true
# action = "file_create"
# pattern = "src/**/*.{ts,tsx,js,jsx}"
# max_risk = "medium"
"#;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, TEMPLATE)?;
    Ok(())
}
