use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Tether.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Policy ──────────────────────────────────────────────────────────
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),

    // ── Security / Validation ───────────────────────────────────────────
    #[error("security: {0}")]
    Security(#[from] SecurityError),

    // ── Audit trail ─────────────────────────────────────────────────────
    #[error("audit: {0}")]
    Audit(#[from] AuditError),

    // ── Bridge (queue, rate limiting, offline buffer) ───────────────────
    #[error("bridge: {0}")]
    Bridge(#[from] BridgeError),

    // ── Transport / Agent process ───────────────────────────────────────
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("environment variable '{0}' is not allowed in config expansion")]
    EnvVarNotAllowed(String),

    #[error("environment variable '{0}' is not set")]
    EnvVarMissing(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Policy errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rule {name}: invalid target pattern '{pattern}': {message}")]
    InvalidPattern {
        name: String,
        pattern: String,
        message: String,
    },
}

// ─── Security errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("unauthorized user: {0}")]
    Unauthorized(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key material: {0}")]
    KeyMaterial(String),
}

// ─── Audit errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Bridge errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("request {0} not found or already handled")]
    RequestGone(String),

    #[error("permission queue is shutting down")]
    ShuttingDown,
}

// ─── Transport / Agent errors ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("notification send failed: {0}")]
    Send(String),

    #[error("agent stdin injection failed")]
    Inject,

    #[error("agent process is not running")]
    AgentNotRunning,
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, TetherError>;
