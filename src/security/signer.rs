//! HMAC signing for remote-control callback tokens.
//!
//! Every inline-button payload that can trigger an action on the bridge is
//! signed and time-bounded so a forged or replayed callback is rejected
//! before it reaches the permission queue.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::SecurityError;

/// Default maximum age for a signed callback (5 minutes).
pub const CALLBACK_MAX_AGE_SECS: i64 = 300;

/// Tolerated clock skew for future-dated timestamps.
const CLOCK_SKEW_SECS: i64 = 60;

/// Signature truncation length. Must stay >= 16 bytes: short enough for
/// transport callback-data limits, long enough to resist forgery.
const SIG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// A verified callback token, split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCallback {
    pub payload: String,
    pub timestamp: i64,
    pub signature: String,
}

/// HMAC-SHA256 signer for callback payloads.
///
/// Constructed once and passed explicitly to whatever builds or verifies
/// tokens; there is no process-global signer.
pub struct CallbackSigner {
    key: Zeroizing<Vec<u8>>,
}

impl CallbackSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Zeroizing::new(key.into()),
        }
    }

    /// Build a signer from a hex-encoded key string.
    pub fn from_hex(hex_key: &str) -> Result<Self, SecurityError> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| SecurityError::KeyMaterial(format!("invalid hex key: {e}")))?;
        Ok(Self::new(key))
    }

    /// Resolve a signing key: explicit config value, then the named
    /// environment variable, then a freshly generated ephemeral key.
    ///
    /// An ephemeral key means tokens stop verifying across restarts, so the
    /// fallback is logged as a warning rather than silently accepted.
    pub fn resolve(explicit: Option<&str>, env_var: &str) -> Result<Self, SecurityError> {
        if let Some(hex_key) = explicit {
            return Self::from_hex(hex_key);
        }
        if let Ok(hex_key) = std::env::var(env_var) {
            match Self::from_hex(&hex_key) {
                Ok(signer) => return Ok(signer),
                Err(e) => {
                    tracing::warn!(%env_var, error = %e, "ignoring malformed key from environment");
                }
            }
        }
        tracing::warn!(
            %env_var,
            "generated ephemeral callback signing key; set {env_var} for verification across restarts"
        );
        Ok(Self::new(generate_key_bytes()))
    }

    /// Sign a callback payload, producing `"payload|timestamp|signature"`.
    ///
    /// The signature is the first 16 bytes of
    /// `HMAC-SHA256(key, "payload|timestamp")`, base64url-encoded without
    /// padding.
    pub fn sign(&self, payload: &str) -> String {
        let timestamp = chrono::Utc::now().timestamp();
        let sig = self.compute(&format!("{payload}|{timestamp}"));
        let sig_b64 = URL_SAFE_NO_PAD.encode(&sig[..SIG_LEN]);
        format!("{payload}|{timestamp}|{sig_b64}")
    }

    /// Verify a signed callback string.
    ///
    /// Returns `None` for anything malformed, expired (older than
    /// `max_age_secs`), future-dated beyond the skew tolerance, or carrying
    /// a signature that does not match. Comparison is constant-time. Never
    /// panics.
    pub fn verify(&self, signed: &str, max_age_secs: i64) -> Option<SignedCallback> {
        let mut parts = signed.rsplitn(3, '|');
        let sig_b64 = parts.next()?;
        let ts_str = parts.next()?;
        let payload = parts.next()?;

        let timestamp: i64 = ts_str.parse().ok()?;
        let now = chrono::Utc::now().timestamp();
        if now - timestamp > max_age_secs {
            return None;
        }
        if timestamp > now + CLOCK_SKEW_SECS {
            return None;
        }

        let received = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;
        let expected = self.compute(&format!("{payload}|{ts_str}"));

        // ct_eq yields false on length mismatch without branching on content.
        if !bool::from(expected[..SIG_LEN].ct_eq(&received)) {
            return None;
        }

        Some(SignedCallback {
            payload: payload.to_string(),
            timestamp,
            signature: sig_b64.to_string(),
        })
    }

    fn compute(&self, message: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_slice())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(message.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn generate_key_bytes() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Generate a hex-encoded 256-bit secret, for `tether sign-key`.
pub fn generate_secret_key() -> String {
    hex::encode(generate_key_bytes())
}

#[cfg(test)]
mod tests {
    use super::{CALLBACK_MAX_AGE_SECS, CallbackSigner, generate_secret_key};

    fn signer() -> CallbackSigner {
        CallbackSigner::new(b"0123456789abcdef0123456789abcdef".to_vec())
    }

    #[test]
    fn sign_verify_round_trip() {
        let s = signer();
        let token = s.sign("approve:ab12cd34");
        let verified = s.verify(&token, CALLBACK_MAX_AGE_SECS).expect("valid token");
        assert_eq!(verified.payload, "approve:ab12cd34");
    }

    #[test]
    fn any_single_character_mutation_is_rejected() {
        let s = signer();
        let token = s.sign("approve:ab12cd34");
        for i in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'x' { b'y' } else { b'x' };
            let Ok(mutated) = String::from_utf8(bytes) else {
                continue;
            };
            if mutated == token {
                continue;
            }
            assert!(
                s.verify(&mutated, CALLBACK_MAX_AGE_SECS).is_none(),
                "mutation at index {i} was accepted"
            );
        }
    }

    #[test]
    fn expired_token_is_rejected_even_with_valid_signature() {
        let s = signer();
        let payload = "deny:ab12cd34";
        let old_ts = chrono::Utc::now().timestamp() - 600;
        // Re-sign manually at a stale timestamp.
        let sig = {
            use base64::Engine as _;
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            let raw = s.compute(&format!("{payload}|{old_ts}"));
            URL_SAFE_NO_PAD.encode(&raw[..16])
        };
        let token = format!("{payload}|{old_ts}|{sig}");
        assert!(s.verify(&token, CALLBACK_MAX_AGE_SECS).is_none());
        // A generous max-age accepts the same token.
        assert!(s.verify(&token, 3600).is_some());
    }

    #[test]
    fn future_dated_token_is_rejected() {
        let s = signer();
        let payload = "halt:ab12cd34";
        let future_ts = chrono::Utc::now().timestamp() + 300;
        let sig = {
            use base64::Engine as _;
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            let raw = s.compute(&format!("{payload}|{future_ts}"));
            URL_SAFE_NO_PAD.encode(&raw[..16])
        };
        let token = format!("{payload}|{future_ts}|{sig}");
        assert!(s.verify(&token, CALLBACK_MAX_AGE_SECS).is_none());
    }

    #[test]
    fn malformed_tokens_are_rejected_not_panicked() {
        let s = signer();
        for bad in ["", "no-separators", "a|b", "payload|not-a-number|sig"] {
            assert!(s.verify(bad, CALLBACK_MAX_AGE_SECS).is_none());
        }
    }

    #[test]
    fn different_key_does_not_verify() {
        let a = CallbackSigner::new(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec());
        let b = CallbackSigner::new(b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_vec());
        let token = a.sign("confirm:halt:now");
        assert!(b.verify(&token, CALLBACK_MAX_AGE_SECS).is_none());
    }

    #[test]
    fn payload_with_separators_survives_round_trip() {
        let s = signer();
        let token = s.sign("confirm:phase:/implement sprint-1");
        let verified = s.verify(&token, CALLBACK_MAX_AGE_SECS).expect("valid");
        assert_eq!(verified.payload, "confirm:phase:/implement sprint-1");
    }

    #[test]
    fn generated_secret_is_hex_256_bit() {
        let key = generate_secret_key();
        assert_eq!(key.len(), 64);
        assert!(hex::decode(&key).is_ok());
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(CallbackSigner::from_hex("zz-not-hex").is_err());
    }
}
