//! Terminal transport for local development.
//!
//! Renders permission requests as boxes on stderr and turns typed replies
//! (`a <request-id>` / `d <request-id>`) into the same signed callback
//! tokens a chat backend would produce, so the whole decision path can be
//! exercised without any remote service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::bridge::{DefaultAction, PermissionRequest, PermissionResponse};
use crate::security::CallbackSigner;
use crate::transport::callback::{CallbackAction, signed_token};
use crate::transport::{MessageHandle, OperatorAction, Transport};

pub struct StdioTransport {
    signer: Arc<CallbackSigner>,
    actions: mpsc::Sender<OperatorAction>,
    operator_id: u64,
}

impl StdioTransport {
    pub fn new(
        signer: Arc<CallbackSigner>,
        actions: mpsc::Sender<OperatorAction>,
        operator_id: u64,
    ) -> Self {
        Self {
            signer,
            actions,
            operator_id,
        }
    }

    /// Read operator replies from stdin until it closes. Spawned alongside
    /// the deck; each valid line becomes a signed [`OperatorAction`].
    pub async fn listen(&self) {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.split_whitespace();
            let (Some(verb), Some(request_id)) = (parts.next(), parts.next()) else {
                continue;
            };
            let action = match verb {
                "a" | "approve" | "y" => CallbackAction::Approve,
                "d" | "deny" | "n" => CallbackAction::Deny,
                "halt" => CallbackAction::Halt,
                _ => {
                    eprintln!("  unrecognized reply; use 'a <id>' or 'd <id>'");
                    continue;
                }
            };
            let token = signed_token(&self.signer, action, request_id, None);
            let sent = self
                .actions
                .send(OperatorAction {
                    user_id: self.operator_id,
                    token,
                })
                .await;
            if sent.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn send_permission_request(
        &self,
        request: &PermissionRequest,
        timeout: Duration,
        default_action: DefaultAction,
    ) -> anyhow::Result<MessageHandle> {
        let default_label = match default_action {
            DefaultAction::Approve => "approve",
            DefaultAction::Deny => "deny",
        };
        eprintln!();
        eprintln!("┌─ Permission Required ────────────────────────────");
        eprintln!("│ Request: {}", request.id);
        eprintln!("│ Action:  {}", request.action);
        eprintln!("│ Target:  {}", request.target);
        eprintln!("│ Risk:    {}", request.risk);
        if !request.context.is_empty() {
            eprintln!("│ Context: {}", request.context);
        }
        eprintln!("├──────────────────────────────────────────────────");
        eprintln!(
            "│ reply 'a {id}' to approve, 'd {id}' to deny",
            id = request.id
        );
        eprintln!(
            "│ defaults to {default_label} in {}s",
            timeout.as_secs()
        );
        eprintln!("└──────────────────────────────────────────────────");
        Ok(MessageHandle(request.id.clone()))
    }

    async fn send_event(&self, text: &str) -> anyhow::Result<()> {
        eprintln!("tether: {text}");
        Ok(())
    }

    async fn render_decision(
        &self,
        handle: Option<&MessageHandle>,
        response: &PermissionResponse,
    ) -> anyhow::Result<()> {
        let verdict = if response.approved { "approved" } else { "denied" };
        let via = response
            .policy_name
            .as_deref()
            .map(|p| format!(" via {p}"))
            .unwrap_or_default();
        let id = handle.map_or(response.request_id.as_str(), |h| h.0.as_str());
        eprintln!("tether: request {id} {verdict}{via}");
        Ok(())
    }

    async fn render_rejection(&self, _user_id: u64, message: &str) -> anyhow::Result<()> {
        eprintln!("tether: {message}");
        Ok(())
    }
}
