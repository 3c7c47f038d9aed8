//! Append-only, hash-chained, HMAC-signed audit store.
//!
//! Each line commits to the signature of the line before it:
//! `hmac = HMAC-SHA256(key, prev_hash_bytes || canonical_json(event))`.
//! Deleting, reordering, or editing any entry breaks either the signature
//! or the linkage, and `verify_audit_log` reports exactly where.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::audit::event::{AuditEvent, AuditEventType, AuditRecord};
use crate::error::AuditError;

/// Environment variable consulted for the audit HMAC key (hex-encoded).
pub const AUDIT_KEY_ENV: &str = "TETHER_AUDIT_KEY";

type HmacSha256 = Hmac<Sha256>;

struct ChainState {
    prev_hash: Vec<u8>,
}

/// Structured JSONL audit logger with integrity protection.
///
/// `append` is the process's one hard global serialization point: the
/// running `prev_hash` and the file write share a single lock so the chain
/// records causal write order.
pub struct AuditLogger {
    log_path: PathBuf,
    session_id: String,
    max_size: u64,
    rotate_count: usize,
    key: Zeroizing<Vec<u8>>,
    chain: Mutex<ChainState>,
    event_count: AtomicU64,
}

impl AuditLogger {
    /// Create a logger writing to `log_path`.
    ///
    /// Key priority: `explicit_key_hex`, then [`AUDIT_KEY_ENV`], then a
    /// freshly generated ephemeral key (with a warning, since verification
    /// across restarts then fails).
    pub fn new(
        log_path: impl Into<PathBuf>,
        explicit_key_hex: Option<&str>,
        max_file_size_mb: u64,
        rotate_count: usize,
    ) -> Result<Self, AuditError> {
        let log_path = log_path.into();
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let key = resolve_key(explicit_key_hex);
        let session_id = generate_session_id();
        tracing::info!(log_path = %log_path.display(), %session_id, "audit logger initialized");

        Ok(Self {
            log_path,
            session_id,
            max_size: max_file_size_mb * 1024 * 1024,
            rotate_count,
            key,
            chain: Mutex::new(ChainState {
                prev_hash: Vec::new(),
            }),
            event_count: AtomicU64::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Append an event to the store.
    ///
    /// Audit durability is best-effort against disk failures: an I/O error
    /// is logged and swallowed so the decision path never rolls back on a
    /// failed write.
    pub fn append(&self, mut event: AuditEvent) {
        if event.session_id.is_empty() {
            event.session_id = self.session_id.clone();
        }
        if let Err(e) = self.append_inner(&event) {
            tracing::error!(error = %e, "failed to write audit log");
        }
    }

    fn append_inner(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut state = self
            .chain
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(rotated_from) = self.maybe_rotate(&mut state)? {
            let mut marker = AuditEvent::new(AuditEventType::LogRotated)
                .meta("previous_segment_hmac", rotated_from);
            marker.session_id = self.session_id.clone();
            self.write_record(&mut state, &marker)?;
        }

        self.write_record(&mut state, event)?;
        self.event_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_record(&self, state: &mut ChainState, event: &AuditEvent) -> Result<(), AuditError> {
        let canonical = event.canonical_json()?;

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(&state.prev_hash);
        mac.update(canonical.as_bytes());
        let signature = mac.finalize().into_bytes();

        let record = AuditRecord {
            event: serde_json::to_value(event)?,
            hmac: hex::encode(signature),
            prev_hash: if state.prev_hash.is_empty() {
                String::new()
            } else {
                hex::encode(&state.prev_hash)
            },
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;

        state.prev_hash = signature.to_vec();
        Ok(())
    }

    /// Rotate when the store exceeds the size threshold. Returns the hex of
    /// the final hmac of the rotated-out segment, which the caller embeds in
    /// the first entry of the fresh chain so the rotation boundary stays
    /// cross-referenced.
    fn maybe_rotate(&self, state: &mut ChainState) -> Result<Option<String>, AuditError> {
        let Ok(meta) = fs::metadata(&self.log_path) else {
            return Ok(None);
        };
        if meta.len() < self.max_size {
            return Ok(None);
        }

        let rotated = |i: usize| PathBuf::from(format!("{}.{i}", self.log_path.display()));

        let oldest = rotated(self.rotate_count);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for i in (1..self.rotate_count).rev() {
            let current = rotated(i);
            if current.exists() {
                fs::rename(&current, rotated(i + 1))?;
            }
        }
        fs::rename(&self.log_path, rotated(1))?;
        tracing::info!(log_path = %self.log_path.display(), "audit log rotated");

        let final_hmac = hex::encode(&state.prev_hash);
        state.prev_hash = Vec::new();
        Ok(Some(final_hmac))
    }

    // ── Convenience constructors for the deck ────────────────────────────

    pub fn log_permission_request(
        &self,
        request_id: &str,
        action: &str,
        target: &str,
        risk_level: &str,
        context: Option<&str>,
    ) {
        let mut event = AuditEvent::new(AuditEventType::PermissionRequested)
            .request_id(request_id)
            .action(action)
            .target(target)
            .risk_level(risk_level);
        if let Some(context) = context {
            event = event.meta("context", context);
        }
        self.append(event);
    }

    pub fn log_permission_response(
        &self,
        request_id: &str,
        approved: bool,
        user_id: u64,
        auto_approved: bool,
        policy_name: Option<&str>,
    ) {
        let event_type = if auto_approved {
            match policy_name {
                Some("timeout") => AuditEventType::PermissionTimeout,
                _ if approved => AuditEventType::PermissionAutoApproved,
                _ => AuditEventType::PermissionDenied,
            }
        } else if approved {
            AuditEventType::PermissionApproved
        } else {
            AuditEventType::PermissionDenied
        };

        let mut event = AuditEvent::new(event_type)
            .request_id(request_id)
            .user_id(user_id);
        if let Some(name) = policy_name {
            event = event.policy_name(name);
        }
        self.append(event);
    }

    pub fn log_policy_evaluation(
        &self,
        request_id: &str,
        action: &str,
        target: &str,
        risk_level: &str,
        matched: bool,
        policy_name: Option<&str>,
        reason: &str,
    ) {
        let event_type = if matched {
            AuditEventType::PolicyMatched
        } else {
            AuditEventType::PolicyEvaluated
        };
        let mut event = AuditEvent::new(event_type)
            .request_id(request_id)
            .action(action)
            .target(target)
            .risk_level(risk_level)
            .meta("reason", reason);
        if let Some(name) = policy_name {
            event = event.policy_name(name);
        }
        self.append(event);
    }

    pub fn log_phase_transition(&self, phase: &str) {
        self.append(AuditEvent::new(AuditEventType::PhaseTransition).phase(phase));
    }

    pub fn log_system(&self, event_type: AuditEventType) {
        self.append(AuditEvent::new(event_type));
    }

    pub fn log_error(&self, error: &str) {
        self.append(AuditEvent::new(AuditEventType::Error).error_text(error));
    }
}

fn resolve_key(explicit_hex: Option<&str>) -> Zeroizing<Vec<u8>> {
    if let Some(hex_key) = explicit_hex {
        match hex::decode(hex_key.trim()) {
            Ok(key) => return Zeroizing::new(key),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed explicit audit key");
            }
        }
    }
    if let Ok(hex_key) = std::env::var(AUDIT_KEY_ENV) {
        match hex::decode(hex_key.trim()) {
            Ok(key) => return Zeroizing::new(key),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed {AUDIT_KEY_ENV}");
            }
        }
    }

    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::rng().fill_bytes(&mut key);
    tracing::warn!(
        "generated ephemeral HMAC key for audit logs; set {AUDIT_KEY_ENV} for verification across restarts"
    );
    Zeroizing::new(key)
}

fn generate_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("tether-{stamp}-{}", &nonce[..6])
}

/// Verify audit store integrity by replaying the hash chain.
///
/// Returns `(valid, errors)`. Every line is checked for chain linkage
/// against the running hash and for signature validity, recomputed over the
/// *stored* `prev_hash` and the record's payload. The running hash then
/// advances to the stored `hmac` regardless, so a single tampered entry is
/// reported once rather than cascading a chain-break error onto every
/// subsequent line. Malformed lines are reported and skipped. An absent
/// file is vacuously valid. Never mutates the store.
pub fn verify_audit_log(log_path: &Path, key: &[u8]) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    let content = match fs::read_to_string(log_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (true, errors),
        Err(e) => {
            errors.push(format!("failed to read log file: {e}"));
            return (false, errors);
        }
    };

    let mut running_prev: Vec<u8> = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: AuditRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                errors.push(format!("line {line_num}: malformed record - {e}"));
                continue;
            }
        };

        let running_hex = hex::encode(&running_prev);
        if running_hex != record.prev_hash {
            errors.push(format!(
                "line {line_num}: hash chain broken (expected prev={}..., got {}...)",
                head(&record.prev_hash),
                head(&running_hex),
            ));
        }

        let stored_prev = match hex::decode(&record.prev_hash) {
            Ok(bytes) => bytes,
            Err(e) => {
                errors.push(format!("line {line_num}: invalid prev_hash hex - {e}"));
                Vec::new()
            }
        };

        let canonical = record.event.to_string();
        let mut mac = HmacSha256::new_from_slice(key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(&stored_prev);
        mac.update(canonical.as_bytes());
        let computed = mac.finalize().into_bytes();

        match hex::decode(&record.hmac) {
            Ok(claimed) => {
                if !bool::from(computed.as_slice().ct_eq(claimed.as_slice())) {
                    errors.push(format!(
                        "line {line_num}: invalid HMAC signature (entry may have been tampered)"
                    ));
                }
                running_prev = claimed;
            }
            Err(e) => {
                errors.push(format!("line {line_num}: invalid hmac hex - {e}"));
                running_prev = Vec::new();
            }
        }
    }

    (errors.is_empty(), errors)
}

fn head(s: &str) -> &str {
    s.get(..8).unwrap_or(s)
}
