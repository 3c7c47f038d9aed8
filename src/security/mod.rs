pub mod redact;
pub mod signer;
pub mod validation;

pub use redact::{redact_keywords, scrub_secret_patterns};
pub use signer::{CALLBACK_MAX_AGE_SECS, CallbackSigner, SignedCallback, generate_secret_key};
pub use validation::{sanitize_for_display, validate_control_command, validate_request_id};
