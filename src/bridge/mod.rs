pub mod offline_queue;
pub mod queue;
pub mod rate_limiter;
pub mod reconnect;

pub use offline_queue::{OfflineQueue, QueuedEvent, QueuedEventType};
pub use queue::{DefaultAction, PermissionQueue, PermissionRequest, PermissionResponse};
pub use rate_limiter::{RateLimiter, UserRateState, UserRateStats};
pub use reconnect::ReconnectionManager;
