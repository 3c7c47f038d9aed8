//! End-to-end permission lifecycle through the deck: policy fast path,
//! human escalation, timeout default, authorization, rate limiting, and the
//! audit trail each of them leaves behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use tether::agent::{ActionKind, AgentHandle, ClassifiedPrompt, RiskLevel};
use tether::audit::verify_audit_log;
use tether::bridge::{DefaultAction, PermissionRequest, PermissionResponse};
use tether::config::Config;
use tether::deck::Deck;
use tether::policy::PolicyRule;
use tether::security::CallbackSigner;
use tether::transport::{
    CallbackAction, MessageHandle, OperatorAction, Transport, signed_token,
};

const AUDIT_KEY_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
const CALLBACK_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
const OPERATOR: u64 = 7;

// ── Test doubles ─────────────────────────────────────────────────

#[derive(Default)]
struct MockTransport {
    sent_requests: Mutex<Vec<PermissionRequest>>,
    events: Mutex<Vec<String>>,
    decisions: Mutex<Vec<PermissionResponse>>,
    rejections: Mutex<Vec<(u64, String)>>,
    fail_sends: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send_permission_request(
        &self,
        request: &PermissionRequest,
        _timeout: Duration,
        _default_action: DefaultAction,
    ) -> anyhow::Result<MessageHandle> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.sent_requests.lock().unwrap().push(request.clone());
        Ok(MessageHandle(format!("msg-{}", request.id)))
    }

    async fn send_event(&self, text: &str) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.events.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn render_decision(
        &self,
        _handle: Option<&MessageHandle>,
        response: &PermissionResponse,
    ) -> anyhow::Result<()> {
        self.decisions.lock().unwrap().push(response.clone());
        Ok(())
    }

    async fn render_rejection(&self, user_id: u64, message: &str) -> anyhow::Result<()> {
        self.rejections
            .lock()
            .unwrap()
            .push((user_id, message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockAgent {
    injected: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentHandle for MockAgent {
    async fn inject(&self, text: &str) -> bool {
        self.injected.lock().unwrap().push(text.to_string());
        true
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _timeout: Duration) -> anyhow::Result<i32> {
        Ok(0)
    }
}

// ── Harness ──────────────────────────────────────────────────────

struct Harness {
    deck: Arc<Deck>,
    transport: Arc<MockTransport>,
    agent: Arc<MockAgent>,
    audit_path: std::path::PathBuf,
    _dir: TempDir,
}

fn harness(policies: Vec<PolicyRule>, timeout_secs: u64) -> Harness {
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");

    let mut config = Config::default();
    config.security.authorized_users = vec![OPERATOR];
    config.timeouts.permission_timeout_seconds = timeout_secs;
    config.audit.log_path.clone_from(&audit_path);
    config.audit.key = Some(AUDIT_KEY_HEX.to_string());
    config.policies = policies;

    let signer = Arc::new(CallbackSigner::new(CALLBACK_KEY.to_vec()));
    let transport = Arc::new(MockTransport::default());
    let agent = Arc::new(MockAgent::default());
    let deck = Arc::new(
        Deck::new(
            config,
            signer,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&agent) as Arc<dyn AgentHandle>,
        )
        .unwrap(),
    );

    Harness {
        deck,
        transport,
        agent,
        audit_path,
        _dir: dir,
    }
}

fn prompt(action: ActionKind, target: &str, risk: RiskLevel) -> ClassifiedPrompt {
    ClassifiedPrompt {
        action,
        target: target.to_string(),
        context: String::new(),
        risk,
    }
}

fn audit_event_types(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|record| {
            record["event"]["event_type"]
                .as_str()
                .map(ToString::to_string)
        })
        .collect()
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn policy_fast_path_auto_approves_without_escalation() {
    let h = harness(
        vec![PolicyRule {
            name: "src-edits".into(),
            enabled: true,
            action: ActionKind::FileEdit,
            pattern: "src/**/*.ts".into(),
            max_risk: RiskLevel::Medium,
        }],
        30,
    );

    Arc::clone(&h.deck)
        .handle_prompt(prompt(
            ActionKind::FileEdit,
            "src/components/Button.ts",
            RiskLevel::Low,
        ))
        .await;

    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["y\n"]);
    assert!(h.transport.sent_requests.lock().unwrap().is_empty());

    let status = h.deck.status();
    assert_eq!(status.auto_approved, 1);
    assert_eq!(status.pending_requests, 0);

    let types = audit_event_types(&h.audit_path);
    assert!(types.contains(&"permission_requested".to_string()));
    assert!(types.contains(&"policy_matched".to_string()));
    assert!(types.contains(&"permission_auto_approved".to_string()));

    let key = hex::decode(AUDIT_KEY_HEX).unwrap();
    let (valid, errors) = verify_audit_log(&h.audit_path, &key);
    assert!(valid, "{errors:?}");
}

#[tokio::test]
async fn risk_exceeded_escalates_to_the_operator() {
    let h = harness(
        vec![PolicyRule {
            name: "src-edits".into(),
            enabled: true,
            action: ActionKind::FileEdit,
            pattern: "src/**/*.ts".into(),
            max_risk: RiskLevel::Medium,
        }],
        30,
    );

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::FileEdit,
        "src/components/Button.ts",
        RiskLevel::Critical,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = h.transport.sent_requests.lock().unwrap().clone();
    assert_eq!(sent.len(), 1, "risk-exceeded must reach the human");
    let request_id = sent[0].id.clone();

    let token = signed_token(
        h.deck.signer(),
        CallbackAction::Approve,
        &request_id,
        None,
    );
    h.deck
        .handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token,
        })
        .await;
    task.await.unwrap();

    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["y\n"]);
    let decisions = h.transport.decisions.lock().unwrap().clone();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].approved);
    assert_eq!(decisions[0].responded_by, OPERATOR);

    let status = h.deck.status();
    assert_eq!(status.manual_approved, 1);

    let types = audit_event_types(&h.audit_path);
    assert!(types.contains(&"callback_received".to_string()));
    assert!(types.contains(&"permission_approved".to_string()));
}

#[tokio::test]
async fn operator_denial_injects_no() {
    let h = harness(vec![], 30);

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::ShellExecute,
        "rm -rf build",
        RiskLevel::High,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let request_id = h.transport.sent_requests.lock().unwrap()[0].id.clone();
    let token = signed_token(h.deck.signer(), CallbackAction::Deny, &request_id, None);
    h.deck
        .handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token,
        })
        .await;
    task.await.unwrap();

    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["n\n"]);
    assert_eq!(h.deck.status().denied, 1);
    assert!(audit_event_types(&h.audit_path).contains(&"permission_denied".to_string()));
}

#[tokio::test]
async fn timeout_applies_the_default_deny() {
    let h = harness(vec![], 1);

    Arc::clone(&h.deck)
        .handle_prompt(prompt(
            ActionKind::FileDelete,
            "important.txt",
            RiskLevel::High,
        ))
        .await;

    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["n\n"]);
    let status = h.deck.status();
    assert_eq!(status.timeouts, 1);
    assert_eq!(status.pending_requests, 0);

    let decisions = h.transport.decisions.lock().unwrap().clone();
    assert_eq!(decisions[0].policy_name.as_deref(), Some("timeout"));
    assert!(audit_event_types(&h.audit_path).contains(&"permission_timeout".to_string()));
}

#[tokio::test]
async fn unauthorized_users_are_rejected_fail_closed() {
    let h = harness(vec![], 30);

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::FileEdit,
        "src/lib.rs",
        RiskLevel::Low,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_id = h.transport.sent_requests.lock().unwrap()[0].id.clone();

    // A correctly signed token from an unauthorized identity still bounces.
    let token = signed_token(h.deck.signer(), CallbackAction::Approve, &request_id, None);
    h.deck
        .handle_operator_action(OperatorAction {
            user_id: 666,
            token,
        })
        .await;

    let rejections = h.transport.rejections.lock().unwrap().clone();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].0, 666);
    assert!(h.deck.status().pending_requests > 0, "request stays pending");

    // Settle the request so the task finishes.
    assert!(h.deck.respond(PermissionResponse::manual(&request_id, false, 0)));
    task.await.unwrap();
}

#[tokio::test]
async fn tampered_tokens_are_rejected() {
    let h = harness(vec![], 30);

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::FileEdit,
        "src/lib.rs",
        RiskLevel::Low,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_id = h.transport.sent_requests.lock().unwrap()[0].id.clone();

    let mut token = signed_token(h.deck.signer(), CallbackAction::Approve, &request_id, None);
    token.pop();
    token.push('A');
    h.deck
        .handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token,
        })
        .await;

    let rejections = h.transport.rejections.lock().unwrap().clone();
    assert!(rejections.iter().any(|(_, m)| m.contains("control token")));
    assert_eq!(h.deck.status().pending_requests, 1);

    assert!(h.deck.respond(PermissionResponse::manual(&request_id, false, 0)));
    task.await.unwrap();
}

#[tokio::test]
async fn double_response_degrades_gracefully() {
    let h = harness(vec![], 30);

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::FileEdit,
        "src/lib.rs",
        RiskLevel::Low,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_id = h.transport.sent_requests.lock().unwrap()[0].id.clone();

    let approve = signed_token(h.deck.signer(), CallbackAction::Approve, &request_id, None);
    let deny = signed_token(h.deck.signer(), CallbackAction::Deny, &request_id, None);

    h.deck
        .handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token: approve,
        })
        .await;
    h.deck
        .handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token: deny,
        })
        .await;
    task.await.unwrap();

    // First response won; the second saw "expired or already handled".
    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["y\n"]);
    let rejections = h.transport.rejections.lock().unwrap().clone();
    assert!(
        rejections
            .iter()
            .any(|(_, m)| m.contains("already handled"))
    );
}

#[tokio::test]
async fn rate_limited_operators_get_a_wait_hint() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.security.authorized_users = vec![OPERATOR];
    config.rate_limit.requests_per_minute = 1;
    config.audit.enabled = false;
    config.audit.log_path = dir.path().join("audit.jsonl");

    let signer = Arc::new(CallbackSigner::new(CALLBACK_KEY.to_vec()));
    let transport = Arc::new(MockTransport::default());
    let agent = Arc::new(MockAgent::default());
    let deck = Arc::new(
        Deck::new(
            config,
            signer,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&agent) as Arc<dyn AgentHandle>,
        )
        .unwrap(),
    );

    for _ in 0..2 {
        deck.handle_operator_action(OperatorAction {
            user_id: OPERATOR,
            token: "garbage".to_string(),
        })
        .await;
    }

    let rejections = transport.rejections.lock().unwrap().clone();
    assert!(
        rejections.iter().any(|(_, m)| m.contains("rate limited")),
        "{rejections:?}"
    );
}

#[tokio::test]
async fn transport_failure_falls_back_to_the_default_action() {
    let h = harness(vec![], 30);
    h.transport.fail_sends.store(true, Ordering::SeqCst);

    Arc::clone(&h.deck)
        .handle_prompt(prompt(
            ActionKind::ShellExecute,
            "cargo publish",
            RiskLevel::Critical,
        ))
        .await;

    // Default action is deny: the agent gets an answer immediately instead
    // of blocking on an unreachable human.
    assert_eq!(h.agent.injected.lock().unwrap().clone(), vec!["n\n"]);
    assert_eq!(h.deck.status().pending_requests, 0);
    assert!(h.deck.status().transport_offline);

    let types = audit_event_types(&h.audit_path);
    assert!(types.contains(&"error".to_string()));
    assert!(types.contains(&"permission_denied".to_string()));
}

#[tokio::test]
async fn racing_responses_through_the_deck_accept_exactly_one() {
    let h = harness(vec![], 30);

    let task = tokio::spawn(Arc::clone(&h.deck).handle_prompt(prompt(
        ActionKind::FileEdit,
        "src/lib.rs",
        RiskLevel::Low,
    )));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_id = h.transport.sent_requests.lock().unwrap()[0].id.clone();

    let mut racers = Vec::new();
    for i in 0..1000u64 {
        let deck = Arc::clone(&h.deck);
        let id = request_id.clone();
        racers.push(tokio::spawn(async move {
            deck.respond(PermissionResponse::manual(&id, i % 2 == 0, i))
        }));
    }

    let mut accepted = 0;
    for racer in racers {
        if racer.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    task.await.unwrap();
    assert_eq!(h.agent.injected.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn control_commands_are_validated_before_injection() {
    let h = harness(vec![], 30);

    assert!(h.deck.handle_control_command(OPERATOR, "/implement sprint-2").await);
    assert!(!h.deck.handle_control_command(OPERATOR, "/implement; rm -rf /").await);
    assert!(!h.deck.handle_control_command(OPERATOR, "/unknown-command").await);

    let injected = h.agent.injected.lock().unwrap().clone();
    assert_eq!(injected, vec!["/implement sprint-2\n"]);
}
