//! Callback token wire format.
//!
//! A button press travels as `"<action>:<request_id>[:<extra>]"` wrapped in
//! a signed, time-bounded token (see [`CallbackSigner`]). The signer is an
//! explicit dependency of both ends; nothing here holds global state.

use strum::{Display, EnumString};

use crate::security::CallbackSigner;

/// The fixed set of remote-control actions a callback may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CallbackAction {
    Approve,
    Deny,
    Cancel,
    Halt,
    Confirm,
}

/// Build the unsigned payload: `"<action>:<request_id>[:<extra>]"`.
pub fn encode_payload(action: CallbackAction, request_id: &str, extra: Option<&str>) -> String {
    match extra {
        Some(extra) => format!("{action}:{request_id}:{extra}"),
        None => format!("{action}:{request_id}"),
    }
}

/// Split a payload back into its parts. Unknown actions yield `None`.
pub fn decode_payload(payload: &str) -> Option<(CallbackAction, String, Option<String>)> {
    let mut parts = payload.splitn(3, ':');
    let action = parts.next()?.parse().ok()?;
    let request_id = parts.next()?.to_string();
    let extra = parts.next().map(ToString::to_string);
    Some((action, request_id, extra))
}

/// Sign a callback payload for transport.
pub fn signed_token(
    signer: &CallbackSigner,
    action: CallbackAction,
    request_id: &str,
    extra: Option<&str>,
) -> String {
    signer.sign(&encode_payload(action, request_id, extra))
}

/// Verify and decode an incoming token. Any forgery, expiry, or malformed
/// payload collapses to `None`; callers render a generic rejection.
pub fn parse_token(
    signer: &CallbackSigner,
    token: &str,
    max_age_secs: i64,
) -> Option<(CallbackAction, String, Option<String>)> {
    let verified = signer.verify(token, max_age_secs)?;
    decode_payload(&verified.payload)
}
