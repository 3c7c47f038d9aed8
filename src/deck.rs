//! The deck wires everything together: classified agent events in, policy
//! evaluation, human escalation over the transport, rate limiting on the
//! way back, an audit record for every decision, and the final answer
//! injected into the agent's stdin.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::agent::{AgentEvent, AgentHandle, ClassifiedPrompt};
use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::bridge::{
    DefaultAction, OfflineQueue, PermissionQueue, PermissionRequest, PermissionResponse,
    QueuedEvent, QueuedEventType, RateLimiter, ReconnectionManager,
};
use crate::config::Config;
use crate::error::Result;
use crate::policy::{PolicyEngine, PolicyMatch};
use crate::security::{
    CallbackSigner, redact_keywords, sanitize_for_display, scrub_secret_patterns,
    validate_control_command, validate_request_id,
};
use crate::transport::{CallbackAction, MessageHandle, OperatorAction, Transport, parse_token};

/// Environment variable consulted for the callback signing key.
pub const CALLBACK_KEY_ENV: &str = "TETHER_CALLBACK_KEY";

const STALE_IDENTITY_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const STALE_IDENTITY_MAX_IDLE: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct Stats {
    auto_approved: AtomicU64,
    manual_approved: AtomicU64,
    denied: AtomicU64,
    timeouts: AtomicU64,
}

/// Snapshot of the bridge for the status surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckStatus {
    pub pending_requests: usize,
    pub auto_approved: u64,
    pub manual_approved: u64,
    pub denied: u64,
    pub timeouts: u64,
    pub policy_count: usize,
    pub policy_evaluations: u64,
    pub transport_offline: bool,
}

pub struct Deck {
    config: Config,
    queue: PermissionQueue,
    policy: PolicyEngine,
    rate_limiter: RateLimiter,
    audit: Option<AuditLogger>,
    offline: OfflineQueue,
    reconnect: ReconnectionManager,
    signer: Arc<CallbackSigner>,
    transport: Arc<dyn Transport>,
    agent: Arc<dyn AgentHandle>,
    stats: Stats,
    offline_notify: tokio::sync::Notify,
}

impl Deck {
    pub fn new(
        config: Config,
        signer: Arc<CallbackSigner>,
        transport: Arc<dyn Transport>,
        agent: Arc<dyn AgentHandle>,
    ) -> Result<Self> {
        let queue = PermissionQueue::new(
            Duration::from_secs(config.timeouts.permission_timeout_seconds),
            config.timeouts.default_action,
        );
        let policy = PolicyEngine::new(config.policies.clone())?;
        let rate_limiter = RateLimiter::new(
            config.rate_limit.requests_per_minute,
            config.rate_limit.denial_backoff_base,
            config.rate_limit.denial_backoff_max,
            config.rate_limit.denial_threshold,
        );
        let audit = if config.audit.enabled {
            Some(AuditLogger::new(
                config.audit.log_path.clone(),
                config.audit.key.as_deref(),
                config.audit.max_file_size_mb,
                config.audit.rotate_count,
            )?)
        } else {
            None
        };
        let offline = OfflineQueue::new(
            config.offline.max_queue_size,
            config.offline.max_event_age_seconds,
        );
        let reconnect = ReconnectionManager::new(
            config.reconnection.initial_delay,
            config.reconnection.max_delay,
            config.reconnection.backoff_factor,
            config.reconnection.max_attempts,
            config.reconnection.jitter,
        );

        Ok(Self {
            config,
            queue,
            policy,
            rate_limiter,
            audit,
            offline,
            reconnect,
            signer,
            transport,
            agent,
            stats: Stats::default(),
            offline_notify: tokio::sync::Notify::new(),
        })
    }

    fn audit(&self) -> Option<&AuditLogger> {
        self.audit.as_ref()
    }

    pub fn signer(&self) -> &Arc<CallbackSigner> {
        &self.signer
    }

    /// Main loop: consume classified agent events and operator actions
    /// until the agent exits or both channels close. Returns the agent's
    /// exit code.
    pub async fn run(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<AgentEvent>,
        mut actions: mpsc::Receiver<OperatorAction>,
    ) -> i32 {
        if let Some(audit) = self.audit() {
            audit.log_system(AuditEventType::BridgeStarted);
        }
        let policy_count = self.policy.rule_count();
        self.send_or_queue(
            QueuedEventType::StatusMessage,
            &format!("bridge started ({policy_count} active policies)"),
            2,
        )
        .await;

        let mut sweep = tokio::time::interval(STALE_IDENTITY_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut exit_code = 0;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AgentEvent::PermissionPrompt(prompt)) => {
                        let deck = Arc::clone(self);
                        tokio::spawn(async move { deck.handle_prompt(prompt).await });
                    }
                    Some(AgentEvent::PhaseTransition { phase }) => self.handle_phase(&phase).await,
                    Some(AgentEvent::Exited { code }) => {
                        exit_code = code;
                        break;
                    }
                    None => break,
                },
                action = actions.recv() => match action {
                    Some(action) => self.handle_operator_action(action).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let swept = self.rate_limiter.sweep_stale(STALE_IDENTITY_MAX_IDLE);
                    if swept > 0 {
                        tracing::debug!(swept, "dropped stale rate-limiter identities");
                    }
                }
                () = self.offline_notify.notified() => {
                    let deck = Arc::clone(self);
                    tokio::spawn(deck.reconnect_and_flush());
                }
            }
        }

        self.shutdown().await;
        exit_code
    }

    /// Process one classified permission prompt end to end.
    pub async fn handle_prompt(self: Arc<Self>, prompt: ClassifiedPrompt) {
        let request = PermissionRequest::new(
            prompt.action,
            prompt.target.clone(),
            prompt.context.clone(),
            prompt.risk,
        );
        tracing::info!(
            request_id = %request.id,
            action = %request.action,
            target = %request.target,
            risk = %request.risk,
            "permission request detected"
        );
        if let Some(audit) = self.audit() {
            audit.log_permission_request(
                &request.id,
                &request.action.to_string(),
                &request.target,
                &request.risk.to_string(),
                (!request.context.is_empty()).then_some(request.context.as_str()),
            );
        }

        let evaluation = self
            .policy
            .evaluate(request.action, &request.target, request.risk);
        if let Some(audit) = self.audit() {
            let (matched, name, reason) = match &evaluation.matched {
                PolicyMatch::AutoApprove { rule } => {
                    (true, Some(rule.name.clone()), format!("matched policy: {}", rule.name))
                }
                PolicyMatch::RiskExceeded { rule, reason } => {
                    (false, Some(rule.name.clone()), reason.clone())
                }
                PolicyMatch::NoMatch { reason } => (false, None, reason.clone()),
            };
            audit.log_policy_evaluation(
                &request.id,
                &request.action.to_string(),
                &request.target,
                &request.risk.to_string(),
                matched,
                name.as_deref(),
                &reason,
            );
        }

        if let PolicyMatch::AutoApprove { rule } = &evaluation.matched {
            self.stats.auto_approved.fetch_add(1, Ordering::Relaxed);
            if let Some(audit) = self.audit() {
                audit.log_permission_response(&request.id, true, 0, true, Some(&rule.name));
            }
            if !self.agent.inject("y\n").await {
                tracing::warn!(request_id = %request.id, "failed to inject auto-approval");
            }
            if self.config.notifications.auto_approvals {
                self.send_or_queue(
                    QueuedEventType::GenericMessage,
                    &format!(
                        "auto-approved by {}: {} {}",
                        rule.name, request.action, request.target
                    ),
                    1,
                )
                .await;
            }
            return;
        }

        // Manual escalation.
        self.escalate(request).await;
    }

    async fn escalate(&self, mut request: PermissionRequest) {
        let timeout = Duration::from_secs(self.config.timeouts.permission_timeout_seconds);
        let handle = match self
            .transport
            .send_permission_request(&request, timeout, self.config.timeouts.default_action)
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                // An unreachable human must not block the agent: fall back
                // to the configured default immediately.
                tracing::error!(request_id = %request.id, error = %e, "failed to deliver permission request");
                let approved = self.config.timeouts.default_action == DefaultAction::Approve;
                if let Some(audit) = self.audit() {
                    audit.log_error(&format!("notification send failed: {e}"));
                    audit.log_permission_response(
                        &request.id,
                        approved,
                        0,
                        true,
                        Some("transport_failure"),
                    );
                }
                if approved {
                    self.stats.auto_approved.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.denied.fetch_add(1, Ordering::Relaxed);
                }
                self.inject_answer(approved).await;
                self.offline.set_offline();
                self.offline_notify.notify_one();
                return;
            }
        };
        request.message_handle = handle.as_ref().map(|h| h.0.clone());

        let request_id = request.id.clone();
        let response = self.queue.add(request).await;

        if response.auto_approved {
            if response.policy_name.as_deref() == Some("timeout") {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        } else if response.approved {
            self.stats.manual_approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(audit) = self.audit() {
            audit.log_permission_response(
                &request_id,
                response.approved,
                response.responded_by,
                response.auto_approved,
                response.policy_name.as_deref(),
            );
        }

        if let Err(e) = self
            .transport
            .render_decision(handle.as_ref(), &response)
            .await
        {
            tracing::warn!(request_id = %request_id, error = %e, "failed to render decision");
        }

        self.inject_answer(response.approved).await;
        tracing::info!(
            request_id = %request_id,
            approved = response.approved,
            auto = response.auto_approved,
            policy = response.policy_name.as_deref().unwrap_or(""),
            "permission resolved"
        );
    }

    async fn inject_answer(&self, approved: bool) {
        let answer = if approved { "y\n" } else { "n\n" };
        if !self.agent.inject(answer).await {
            tracing::warn!("failed to inject response into agent stdin");
        }
    }

    /// Process one incoming operator interaction: authorization, rate
    /// limiting, token verification, then the action itself.
    pub async fn handle_operator_action(&self, action: OperatorAction) {
        let user_id = action.user_id;

        if !self.config.security.is_authorized(user_id) {
            if self.config.security.log_unauthorized_attempts {
                tracing::warn!(user_id, "unauthorized interaction rejected");
                if let Some(audit) = self.audit() {
                    audit.append(
                        AuditEvent::new(AuditEventType::Warning)
                            .user_id(user_id)
                            .error_text("unauthorized interaction"),
                    );
                }
            }
            let _ = self.transport.render_rejection(user_id, "not authorized").await;
            return;
        }

        let (allowed, wait) = self.rate_limiter.check_rate_limit(user_id);
        if !allowed {
            let wait = wait.unwrap_or(1.0);
            let _ = self
                .transport
                .render_rejection(user_id, &format!("rate limited, retry in {wait:.0}s"))
                .await;
            return;
        }
        self.rate_limiter.record_request(user_id);

        let Some((callback, request_id, extra)) = parse_token(
            &self.signer,
            &action.token,
            self.config.timeouts.callback_max_age_seconds,
        ) else {
            tracing::warn!(user_id, "invalid or expired callback token");
            let _ = self
                .transport
                .render_rejection(user_id, "invalid or expired control token")
                .await;
            return;
        };
        if let Some(audit) = self.audit() {
            audit.append(
                AuditEvent::new(AuditEventType::CallbackReceived)
                    .user_id(user_id)
                    .request_id(request_id.clone())
                    .meta("callback", callback.to_string()),
            );
        }

        match callback {
            CallbackAction::Approve => self.resolve(user_id, &request_id, true).await,
            CallbackAction::Deny | CallbackAction::Cancel => {
                self.resolve(user_id, &request_id, false).await;
            }
            CallbackAction::Halt => self.handle_halt(user_id).await,
            CallbackAction::Confirm => {
                if request_id == "phase"
                    && let Some(command) = extra
                {
                    self.handle_control_command(user_id, &command).await;
                } else {
                    let _ = self
                        .transport
                        .render_rejection(user_id, "nothing to confirm")
                        .await;
                }
            }
        }
    }

    async fn resolve(&self, user_id: u64, request_id: &str, approved: bool) {
        if validate_request_id(request_id).is_err() {
            let _ = self
                .transport
                .render_rejection(user_id, "invalid request id")
                .await;
            return;
        }

        let accepted = self
            .queue
            .respond(PermissionResponse::manual(request_id, approved, user_id));
        if accepted {
            if approved {
                self.rate_limiter.record_approval(user_id);
            } else {
                self.rate_limiter.record_denial(user_id);
            }
        } else {
            tracing::warn!(request_id, user_id, "response for unknown or settled request");
            let _ = self
                .transport
                .render_rejection(user_id, "request expired or already handled")
                .await;
        }
    }

    async fn handle_halt(&self, user_id: u64) {
        tracing::info!(user_id, "halt requested by operator");
        if self.agent.is_running() {
            if let Err(e) = self.agent.interrupt().await {
                tracing::warn!(error = %e, "failed to interrupt agent");
            }
        }
    }

    /// Inject a validated control command into the agent.
    pub async fn handle_control_command(&self, user_id: u64, command: &str) -> bool {
        let validated = match validate_control_command(
            command,
            &self.config.security.allowed_control_commands,
        ) {
            Ok(validated) => validated,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    command = %sanitize_for_display(command, 50),
                    "rejected control command"
                );
                let _ = self
                    .transport
                    .render_rejection(user_id, &format!("invalid command: {e}"))
                    .await;
                return false;
            }
        };

        if !self.agent.is_running() {
            let _ = self
                .transport
                .render_rejection(user_id, "agent is not running")
                .await;
            return false;
        }

        let sent = self.agent.inject(&format!("{validated}\n")).await;
        if sent {
            self.send_or_queue(
                QueuedEventType::StatusMessage,
                &format!("command sent: {}", sanitize_for_display(&validated, 100)),
                1,
            )
            .await;
        } else {
            let _ = self
                .transport
                .render_rejection(user_id, "could not send command to agent")
                .await;
        }
        sent
    }

    async fn handle_phase(&self, phase: &str) {
        if let Some(audit) = self.audit() {
            audit.log_phase_transition(phase);
        }
        if self.config.notifications.phase_transitions {
            self.send_or_queue(
                QueuedEventType::PhaseNotification,
                &format!("phase: {phase}"),
                1,
            )
            .await;
        }
    }

    /// Send a notification, redacting secrets first; queue it when the
    /// transport is down and kick off reconnection.
    async fn send_or_queue(&self, event_type: QueuedEventType, text: &str, priority: u8) {
        let scrubbed = scrub_secret_patterns(text);
        let redacted = redact_keywords(&scrubbed, &self.config.security.redact_patterns);

        if self.offline.is_offline() {
            self.offline
                .enqueue(QueuedEvent::new(event_type, redacted, priority))
                .await;
            return;
        }

        if let Err(e) = self.transport.send_event(&redacted).await {
            tracing::warn!(error = %e, "notification send failed; buffering");
            self.offline.set_offline();
            self.offline_notify.notify_one();
            if let Some(audit) = self.audit() {
                audit.log_system(AuditEventType::TransportDisconnected);
            }
            self.offline
                .enqueue(QueuedEvent::new(event_type, redacted, priority))
                .await;
        }
    }

    /// Drive reconnection until the transport reports healthy again, then
    /// flush the offline buffer. Intended to be spawned.
    pub async fn reconnect_and_flush(self: Arc<Self>) {
        let transport = Arc::clone(&self.transport);
        let connected = self
            .reconnect
            .attempt_reconnect(move || {
                let transport = Arc::clone(&transport);
                async move {
                    if transport.health_check().await {
                        Ok(())
                    } else {
                        anyhow::bail!("transport still unreachable")
                    }
                }
            })
            .await;
        if !connected {
            return;
        }

        self.offline.set_online();
        if let Some(audit) = self.audit() {
            audit.log_system(AuditEventType::TransportReconnected);
        }
        let transport = Arc::clone(&self.transport);
        self.offline
            .flush(move |event| {
                let transport = Arc::clone(&transport);
                async move { transport.send_event(&event.body).await.is_ok() }
            })
            .await;
    }

    /// Cancel pending work and stop the agent. Safe to call once at the end
    /// of `run`.
    pub async fn shutdown(&self) {
        let cancelled = self.queue.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending permission requests");
        }
        self.reconnect.cancel();

        if self.agent.is_running() {
            match self.agent.stop(Duration::from_secs(10)).await {
                Ok(code) => tracing::info!(exit_code = code, "agent stopped"),
                Err(e) => tracing::warn!(error = %e, "failed to stop agent"),
            }
        }

        if let Some(audit) = self.audit() {
            audit.log_system(AuditEventType::BridgeStopped);
        }
        let _ = self.transport.send_event("bridge shutting down").await;
    }

    pub fn status(&self) -> DeckStatus {
        DeckStatus {
            pending_requests: self.queue.pending_count(),
            auto_approved: self.stats.auto_approved.load(Ordering::Relaxed),
            manual_approved: self.stats.manual_approved.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            policy_count: self.policy.rule_count(),
            policy_evaluations: self.policy.evaluation_count(),
            transport_offline: self.offline.is_offline(),
        }
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.queue.all_pending()
    }

    /// Direct access for transports that resolve requests in-process.
    pub fn respond(&self, response: PermissionResponse) -> bool {
        self.queue.respond(response)
    }

    pub fn message_handle_for(&self, request_id: &str) -> Option<MessageHandle> {
        self.queue
            .get_pending(request_id)
            .and_then(|r| r.message_handle)
            .map(MessageHandle)
    }
}
