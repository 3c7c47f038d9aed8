mod event;
mod logger;

pub use event::{AuditEvent, AuditEventType, AuditRecord};
pub use logger::{AUDIT_KEY_ENV, AuditLogger, verify_audit_log};
