pub mod schema;

pub use schema::{
    AgentConfig, AuditConfig, Config, NotificationConfig, OfflineConfig, RateLimitConfig,
    ReconnectConfig, SecuritySettings, TimeoutConfig, TransportConfig, default_config_path,
    write_template,
};
