//! Serde request/response types for the approval HTTP API, plus the two
//! JSON schemas that travel inside the encrypted channel.
//!
//! Conventions: timestamps are RFC 3339 UTC with a trailing `Z`; every
//! `pake_message` / `encrypted_payload` field is standard-alphabet base64.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

// ─────────────────────────────────────────────────────────────────────────────
// Pairing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiateRequest {
    pub agent_id: String,
    pub agent_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub pairing_code: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub pairing_code: String,
    /// Base64 initiator SPAKE2 element.
    pub pake_message: String,
}

/// `pairing/exchange` success body. While the human has not acted the
/// endpoint instead answers 202 with `{"status": "waiting"}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub session_id: String,
    /// Base64 responder SPAKE2 element.
    pub pake_message: String,
    pub agent_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialRequestBody {
    pub session_id: String,
    pub encrypted_payload: String,
}

/// `credential/request` response. `status` is one of `approved`, `denied`,
/// `error`; exactly one of the optional fields accompanies it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialResponseBody {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Plaintext schema of an encrypted credential request.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialRequestPayload {
    pub domain: String,
    pub reason: String,
    pub agent_id: String,
    pub agent_name: String,
    /// RFC 3339 UTC, trailing `Z`. Checked against the replay window.
    pub timestamp: String,
    /// 16 hex chars, accepted at most once per session inside the window.
    pub nonce: String,
}

/// Plaintext schema of an encrypted credential response. Zeroized on drop;
/// move the fields into a `SecureCredential` rather than cloning them around.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub username: String,
    pub password: String,
    pub timestamp: String,
    pub nonce: String,
}

impl Drop for CredentialPayload {
    fn drop(&mut self) {
        self.username.zeroize();
        self.password.zeroize();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub revoked: bool,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub active: bool,
    pub agent_name: String,
    pub last_access: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

/// Error body for 4xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_response_omits_absent_fields() {
        let approved = CredentialResponseBody {
            status: "approved".into(),
            encrypted_payload: Some("AAAA".into()),
            error: None,
        };
        let json = serde_json::to_string(&approved).unwrap();
        assert!(json.contains("encrypted_payload"));
        assert!(!json.contains("error"));

        let denied: CredentialResponseBody =
            serde_json::from_str(r#"{"status":"denied","error":"User denied"}"#).unwrap();
        assert_eq!(denied.status, "denied");
        assert!(denied.encrypted_payload.is_none());
    }

    #[test]
    fn request_payload_requires_every_field() {
        let missing_nonce = r#"{
            "domain": "aa.com", "reason": "r", "agent_id": "a",
            "agent_name": "A", "timestamp": "2026-08-01T00:00:00.000000Z"
        }"#;
        assert!(serde_json::from_str::<CredentialRequestPayload>(missing_nonce).is_err());
    }
}
