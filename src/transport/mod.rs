//! Operator transport.
//!
//! The chat backend (Telegram, Slack, whatever carries the buttons) lives
//! outside this crate. The deck only needs the [`Transport`] trait: deliver
//! a request or notification, render the outcome, and feed incoming
//! operator actions back as signed callback tokens.

pub mod callback;
pub mod stdio;

pub use callback::{CallbackAction, decode_payload, encode_payload, parse_token, signed_token};
pub use stdio::StdioTransport;

use std::time::Duration;

use async_trait::async_trait;

use crate::bridge::{DefaultAction, PermissionRequest, PermissionResponse};

/// Opaque correlation handle for a message the transport delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle(pub String);

/// An incoming operator interaction: who pressed, and the signed callback
/// token proving what they pressed.
#[derive(Debug, Clone)]
pub struct OperatorAction {
    pub user_id: u64,
    pub token: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a permission request to the operator. The rendering must show
    /// the countdown to the default action so the human knows the failure
    /// mode. Returns a handle correlating later edits to this message.
    async fn send_permission_request(
        &self,
        request: &PermissionRequest,
        timeout: Duration,
        default_action: DefaultAction,
    ) -> anyhow::Result<MessageHandle>;

    /// Send a plain notification (phase transitions, status, lifecycle).
    async fn send_event(&self, text: &str) -> anyhow::Result<()>;

    /// Render the final decision onto the original request message.
    async fn render_decision(
        &self,
        handle: Option<&MessageHandle>,
        response: &PermissionResponse,
    ) -> anyhow::Result<()>;

    /// Tell the operator an interaction was rejected (rate limited, expired,
    /// unauthorized). `message` is already sanitized for display.
    async fn render_rejection(&self, user_id: u64, message: &str) -> anyhow::Result<()>;

    /// Whether the transport believes it is currently connected.
    async fn health_check(&self) -> bool {
        true
    }
}
