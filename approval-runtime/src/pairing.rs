//! Pairing and session lifecycle for the approval service.
//!
//! Vault unlock timing is the load-bearing design point here:
//! - The vault is unlocked ONCE, when the human enters the pairing code plus
//!   master password.
//! - The master password is used immediately and discarded; only the vault's
//!   session token is stored, first on the pairing and then on the session.
//! - Credential requests spend the stored token. Nothing ever prompts for or
//!   stores the password again, and the token never leaves this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use zeroize::Zeroize;

use crate::api_types::{CredentialPayload, CredentialRequestPayload};
use crate::audit::AuditLog;
use crate::error::{BrokerError, Result};
use crate::pake::{PakeChannel, Role};
use crate::util::{parse_rfc3339, rfc3339};
use crate::vault::VaultDriver;

/// Pairing codes live for five minutes, one-time use.
pub const PAIRING_TTL_SECS: i64 = 300;
/// Sessions live for thirty minutes, absolute from creation.
pub const SESSION_TTL_SECS: i64 = 1800;
/// Request timestamps are accepted within ±5 minutes; a nonce is accepted at
/// most once inside that window.
pub const REPLAY_WINDOW_SECS: i64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A pairing that has been initiated but not yet promoted to a session.
#[derive(Clone, Debug)]
pub struct PairingState {
    pub agent_id: String,
    pub agent_name: String,
    pub pairing_code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Initiator SPAKE2 element, present once the agent has polled.
    pub agent_pake_message: Option<Vec<u8>>,
    /// Latched when the human supplies the code and a valid master password.
    pub user_entered: bool,
    /// Vault session token, present iff `user_entered`.
    pub vault_token: Option<String>,
}

/// An established secure channel with vault access.
///
/// Holds the completed PAKE responder and the vault token — never the master
/// password.
pub(crate) struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub(crate) channel: PakeChannel,
    pub(crate) vault_token: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Nonces seen inside the replay window, value = first-seen time.
    pub(crate) recent_nonces: HashMap<String, DateTime<Utc>>,
}

/// Identity snapshot handed to the approval handler while no lock is held.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
}

/// Read-only session snapshot for `/session/status`.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub active: bool,
    pub agent_name: String,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Approval callbacks
// ─────────────────────────────────────────────────────────────────────────────

/// The human's answer to a credential request.
#[derive(Clone, Debug)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Optional denial detail shown to the agent instead of "User denied".
    pub reason: Option<String>,
}

/// Surface the approver UI implements.
///
/// The manager calls this without inspecting the concrete type.
/// `on_credential_request` blocks until the human answers — possibly minutes —
/// and runs with no manager lock held. It must not prompt for a password.
#[async_trait::async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// A new pairing exists; show the code to the human. Side-effect only.
    fn on_pairing_created(&self, pairing: &PairingState);

    /// Ask the human to approve or deny a credential release.
    async fn on_credential_request(
        &self,
        session: &SessionSummary,
        domain: &str,
        reason: &str,
    ) -> ApprovalDecision;
}

/// Headless handler answering every request the same way. For tests and
/// non-interactive setups.
pub struct AutoApprover {
    pub approve: bool,
}

#[async_trait::async_trait]
impl ApprovalHandler for AutoApprover {
    fn on_pairing_created(&self, _pairing: &PairingState) {}

    async fn on_credential_request(
        &self,
        _session: &SessionSummary,
        _domain: &str,
        _reason: &str,
    ) -> ApprovalDecision {
        ApprovalDecision {
            approved: self.approve,
            reason: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a `pairing/exchange` poll.
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// The human has not entered the code yet; the agent should keep polling.
    Waiting,
    /// PAKE completed; a session now exists.
    Established {
        session_id: String,
        responder_message_b64: String,
        agent_id: String,
    },
}

/// Result of a `credential/request` that reached a human decision.
#[derive(Debug)]
pub enum CredentialOutcome {
    Approved { encrypted_payload: String },
    Denied { error: String },
}

enum Lookup<T> {
    Missing,
    Expired,
    Found(T),
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    pending_pairings: HashMap<String, PairingState>,
    active_sessions: HashMap<String, Session>,
}

/// Sole owner of the pairing and session tables.
///
/// One mutex guards both tables. Everything under it is non-blocking; vault
/// calls and the approval callback run with the lock released, and callers
/// re-validate the record afterwards.
pub struct PairingManager {
    tables: Mutex<Tables>,
    vault: Arc<dyn VaultDriver>,
    handler: Mutex<Option<Arc<dyn ApprovalHandler>>>,
    audit: Option<AuditLog>,
}

impl PairingManager {
    pub fn new(vault: Arc<dyn VaultDriver>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            vault,
            handler: Mutex::new(None),
            audit: None,
        }
    }

    /// Attach an audit trail. Builder-style, called before the manager is
    /// shared.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register the approver UI. The last registration wins.
    pub fn set_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_handler(&self) -> Option<Arc<dyn ApprovalHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── create_pairing ──────────────────────────────────────────────────────

    /// Create a pairing: draw a fresh 6-digit code, store the pending state,
    /// and notify the approver UI.
    pub fn create_pairing(&self, agent_id: &str, agent_name: &str) -> (String, DateTime<Utc>) {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(PAIRING_TTL_SECS);

        let pairing = {
            let mut tables = self.lock_tables();
            let pairing_code = loop {
                let candidate = OsRng.gen_range(100_000..1_000_000u32).to_string();
                if !tables.pending_pairings.contains_key(&candidate) {
                    break candidate;
                }
            };
            let pairing = PairingState {
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                pairing_code: pairing_code.clone(),
                created_at: now,
                expires_at,
                agent_pake_message: None,
                user_entered: false,
                vault_token: None,
            };
            tables
                .pending_pairings
                .insert(pairing_code, pairing.clone());
            pairing
        };

        tracing::info!(
            "pairing {} created for {} ({}), expires {}",
            pairing.pairing_code,
            pairing.agent_name,
            pairing.agent_id,
            rfc3339(expires_at),
        );

        if let Some(handler) = self.current_handler() {
            handler.on_pairing_created(&pairing);
        }

        (pairing.pairing_code, expires_at)
    }

    // ── mark_user_entered_code ──────────────────────────────────────────────

    /// The human entered a pairing code and master password. Unlock the vault
    /// and latch the pairing.
    ///
    /// This is the single point where the master password enters the process.
    /// The buffer is zeroized on every exit path and never stored or logged.
    /// A failed unlock leaves the pairing pending so the human can retry
    /// within the window.
    pub async fn mark_user_entered_code(
        &self,
        pairing_code: &str,
        mut master_password: String,
    ) -> bool {
        {
            let mut tables = self.lock_tables();
            let expired = match tables.pending_pairings.get(pairing_code) {
                None => {
                    tracing::warn!("code entry for unknown pairing {pairing_code}");
                    master_password.zeroize();
                    return false;
                }
                Some(pairing) => Utc::now() > pairing.expires_at,
            };
            if expired {
                tracing::warn!("code entry for expired pairing {pairing_code}");
                tables.pending_pairings.remove(pairing_code);
                master_password.zeroize();
                return false;
            }
        }

        // Vault unlock blocks; run it with the lock released.
        let unlock_result = self.vault.unlock(&master_password).await;
        master_password.zeroize();

        let vault_token = match unlock_result {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!("vault unlock failed for pairing {pairing_code}: {err}");
                return false;
            }
        };

        let orphaned = {
            let mut tables = self.lock_tables();
            let state = match tables.pending_pairings.get(pairing_code) {
                None => None,
                Some(pairing) => Some(Utc::now() > pairing.expires_at),
            };
            match state {
                None => true,
                Some(true) => {
                    tables.pending_pairings.remove(pairing_code);
                    true
                }
                Some(false) => {
                    if let Some(pairing) = tables.pending_pairings.get_mut(pairing_code) {
                        pairing.vault_token = Some(vault_token);
                        pairing.user_entered = true;
                    }
                    false
                }
            }
        };

        if orphaned {
            // The pairing vanished while we were unlocking (expiry or sweep).
            // Don't leave the vault open with nowhere to carry the token.
            tracing::warn!("pairing {pairing_code} gone after unlock, relocking vault");
            if let Err(err) = self.vault.lock().await {
                tracing::warn!("vault relock failed: {err}");
            }
            return false;
        }

        tracing::info!("vault unlocked for pairing {pairing_code}");
        true
    }

    // ── exchange_pake_message ───────────────────────────────────────────────

    /// Handle one `pairing/exchange` poll from the agent.
    ///
    /// Stores the initiator element, and either reports `Waiting` (human has
    /// not entered the code) or promotes the pairing to a session. Promotion
    /// is one-shot: concurrent polls are serialized by the table lock and
    /// only the first can succeed.
    ///
    /// If SPAKE2 completion fails after the human has already unlocked, the
    /// pairing is discarded and the vault relocked — the unlock must not
    /// outlive the exchange that justified it.
    pub async fn exchange_pake_message(
        &self,
        pairing_code: &str,
        pake_message_b64: &str,
    ) -> Result<ExchangeOutcome> {
        let agent_message = BASE64
            .decode(pake_message_b64.trim())
            .map_err(|_| BrokerError::BadRequest("Invalid pake_message encoding".into()))?;

        enum Promotion {
            Waiting,
            Failed,
            Done {
                session_id: String,
                responder_message_b64: String,
                agent_id: String,
                agent_name: String,
            },
        }

        let promotion = {
            let mut tables = self.lock_tables();

            let expired = match tables.pending_pairings.get(pairing_code) {
                None => {
                    tracing::warn!("exchange for unknown pairing {pairing_code}");
                    return Err(BrokerError::InvalidPairing);
                }
                Some(pairing) => Utc::now() > pairing.expires_at,
            };
            if expired {
                tracing::warn!("exchange for expired pairing {pairing_code}");
                tables.pending_pairings.remove(pairing_code);
                return Err(BrokerError::ExpiredPairing);
            }

            let user_entered = {
                let Some(pairing) = tables.pending_pairings.get_mut(pairing_code) else {
                    return Err(BrokerError::InvalidPairing);
                };
                // Idempotent across polls: later polls overwrite with the
                // same element.
                pairing.agent_pake_message = Some(agent_message.clone());
                pairing.user_entered
            };
            if !user_entered {
                return Ok(ExchangeOutcome::Waiting);
            }

            // Promotion consumes the pairing whatever happens next.
            let Some(pairing) = tables.pending_pairings.remove(pairing_code) else {
                return Err(BrokerError::InvalidPairing);
            };

            let mut channel = PakeChannel::new(Role::Responder);
            let responder_message = channel.start(pairing_code)?;

            if channel.finish(&agent_message).is_err() {
                Promotion::Failed
            } else {
                let Some(vault_token) = pairing.vault_token else {
                    return Err(BrokerError::State(
                        "pairing latched without a vault token".into(),
                    ));
                };

                let mut id_bytes = [0u8; 16];
                OsRng.fill_bytes(&mut id_bytes);
                let session_id = format!("sess_{}", hex::encode(id_bytes));

                let now = Utc::now();
                let session = Session {
                    session_id: session_id.clone(),
                    agent_id: pairing.agent_id.clone(),
                    agent_name: pairing.agent_name.clone(),
                    channel,
                    vault_token,
                    created_at: now,
                    last_access: now,
                    expires_at: now + Duration::seconds(SESSION_TTL_SECS),
                    recent_nonces: HashMap::new(),
                };
                tables.active_sessions.insert(session_id.clone(), session);

                Promotion::Done {
                    session_id,
                    responder_message_b64: BASE64.encode(responder_message),
                    agent_id: pairing.agent_id,
                    agent_name: pairing.agent_name,
                }
            }
        };

        match promotion {
            Promotion::Waiting => Ok(ExchangeOutcome::Waiting),
            Promotion::Failed => {
                tracing::warn!("PAKE completion failed for pairing {pairing_code}, relocking vault");
                if let Err(err) = self.vault.lock().await {
                    tracing::warn!("vault relock failed: {err}");
                }
                Err(BrokerError::PakeFailed)
            }
            Promotion::Done {
                session_id,
                responder_message_b64,
                agent_id,
                agent_name,
            } => {
                tracing::info!("session {session_id} established for {agent_name}");
                Ok(ExchangeOutcome::Established {
                    session_id,
                    responder_message_b64,
                    agent_id,
                })
            }
        }
    }

    // ── handle_credential_request ───────────────────────────────────────────

    /// Handle an encrypted credential request end to end: decrypt, defend
    /// against replay, ask the human, read the vault, encrypt the answer.
    ///
    /// The table lock is dropped across the human callback and every vault
    /// call; the session is re-validated each time the lock is retaken.
    pub async fn handle_credential_request(
        &self,
        session_id: &str,
        encrypted_payload: &str,
    ) -> Result<CredentialOutcome> {
        // Decrypt and replay-check under the lock (CPU only).
        let phase1 = self.with_live_session(session_id, |session| {
            let plaintext = session.channel.decrypt(encrypted_payload)?;
            let request: CredentialRequestPayload =
                serde_json::from_str(&plaintext).map_err(|_| BrokerError::DecryptionFailed)?;

            let timestamp =
                parse_rfc3339(&request.timestamp).ok_or(BrokerError::DecryptionFailed)?;
            let now = Utc::now();
            let age = now - timestamp;
            let window = Duration::seconds(REPLAY_WINDOW_SECS);
            if age > window || age < -window {
                return Err(BrokerError::Replay(
                    "Request too old (possible replay attack)".into(),
                ));
            }

            session
                .recent_nonces
                .retain(|_, seen| now - *seen <= window);
            if session
                .recent_nonces
                .insert(request.nonce.clone(), now)
                .is_some()
            {
                return Err(BrokerError::Replay(
                    "Duplicate request nonce (possible replay attack)".into(),
                ));
            }

            let summary = SessionSummary {
                session_id: session.session_id.clone(),
                agent_id: session.agent_id.clone(),
                agent_name: session.agent_name.clone(),
            };
            Ok((summary, request))
        });

        let (summary, request) = match phase1 {
            Lookup::Missing => return Err(BrokerError::InvalidSession),
            Lookup::Expired => return self.expire_inline(session_id).await,
            Lookup::Found(result) => result?,
        };

        if let Some(audit) = &self.audit {
            audit.request(&summary.agent_id, &request.domain, &request.reason);
        }

        // Block on the human with no lock held.
        let Some(handler) = self.current_handler() else {
            tracing::error!("credential request with no approval handler registered");
            return Err(BrokerError::State("No approval handler registered".into()));
        };
        let decision = handler
            .on_credential_request(&summary, &request.domain, &request.reason)
            .await;

        if !decision.approved {
            tracing::info!("request denied for {}", request.domain);
            if let Some(audit) = &self.audit {
                audit.denied(&summary.agent_id, &request.domain);
            }
            return Ok(CredentialOutcome::Denied {
                error: decision.reason.unwrap_or_else(|| "User denied".into()),
            });
        }

        // The human may have taken minutes; make sure the session survived.
        let vault_token = match self.with_live_session(session_id, |s| s.vault_token.clone()) {
            Lookup::Missing => return Err(BrokerError::InvalidSession),
            Lookup::Expired => return self.expire_inline(session_id).await,
            Lookup::Found(token) => token,
        };

        let items = match self.vault.list_items(&request.domain, &vault_token).await {
            Ok(items) => items,
            Err(err) => {
                if let Some(audit) = &self.audit {
                    audit.error(&summary.agent_id, &request.domain, &err.to_string());
                }
                return Err(err);
            }
        };

        let Some(item) = items.iter().find(|item| item.is_login()) else {
            tracing::warn!("no credential found for {}", request.domain);
            if let Some(audit) = &self.audit {
                audit.not_found(&summary.agent_id, &request.domain);
            }
            return Err(BrokerError::NotFound(request.domain.clone()));
        };

        let username = item
            .login
            .as_ref()
            .and_then(|login| login.username.clone())
            .filter(|u| !u.is_empty());
        let password = item
            .login
            .as_ref()
            .and_then(|login| login.password.clone())
            .filter(|p| !p.is_empty());
        let (Some(username), Some(password)) = (username, password) else {
            if let Some(audit) = &self.audit {
                audit.error(&summary.agent_id, &request.domain, "incomplete vault record");
            }
            return Err(BrokerError::IncompleteRecord(
                "missing username or password".into(),
            ));
        };

        let mut nonce_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_bytes);
        let payload = CredentialPayload {
            username,
            password,
            timestamp: rfc3339(Utc::now()),
            nonce: hex::encode(nonce_bytes),
        };
        let mut plaintext = serde_json::to_string(&payload)
            .map_err(|err| BrokerError::State(format!("credential encoding failed: {err}")))?;
        drop(payload);

        let encrypted = self.with_live_session(session_id, |session| {
            session.channel.encrypt(&plaintext)
        });
        plaintext.zeroize();

        let encrypted_payload = match encrypted {
            Lookup::Missing => return Err(BrokerError::InvalidSession),
            Lookup::Expired => return self.expire_inline(session_id).await,
            Lookup::Found(result) => result?,
        };

        tracing::info!("credential released for {}", request.domain);
        if let Some(audit) = &self.audit {
            audit.success(&summary.agent_id, &request.domain);
        }
        Ok(CredentialOutcome::Approved { encrypted_payload })
    }

    /// Look up a session, expiring it in place when past its deadline and
    /// refreshing `last_access` otherwise. The closure runs under the lock
    /// and must not block.
    fn with_live_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Lookup<T> {
        let mut tables = self.lock_tables();
        let now = Utc::now();

        let expired = match tables.active_sessions.get(session_id) {
            None => return Lookup::Missing,
            Some(session) => now > session.expires_at,
        };
        if expired {
            tables.active_sessions.remove(session_id);
            return Lookup::Expired;
        }

        let Some(session) = tables.active_sessions.get_mut(session_id) else {
            return Lookup::Missing;
        };
        session.last_access = now;
        Lookup::Found(f(session))
    }

    /// A session was found expired mid-request: its vault unlock ends with it.
    async fn expire_inline(&self, session_id: &str) -> Result<CredentialOutcome> {
        tracing::warn!("session {session_id} expired");
        if let Err(err) = self.vault.lock().await {
            tracing::warn!("vault lock on expiry failed: {err}");
        }
        Err(BrokerError::ExpiredSession)
    }

    // ── session management ──────────────────────────────────────────────────

    /// Revoke a session and lock the vault. No-op when absent; returns
    /// whether a session was actually removed.
    pub async fn revoke_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut tables = self.lock_tables();
            tables.active_sessions.remove(session_id).is_some()
        };

        if removed {
            if let Err(err) = self.vault.lock().await {
                tracing::warn!("vault lock on revoke failed: {err}");
            }
            tracing::info!("session {session_id} revoked");
        }
        removed
    }

    /// Read-only status snapshot. Expired sessions are unreachable.
    pub fn get_session_status(&self, session_id: &str) -> Option<SessionStatus> {
        let tables = self.lock_tables();
        let session = tables.active_sessions.get(session_id)?;
        if Utc::now() > session.expires_at {
            return None;
        }
        Some(SessionStatus {
            active: true,
            agent_name: session.agent_name.clone(),
            last_access: session.last_access,
            expires_at: session.expires_at,
        })
    }

    pub fn active_session_count(&self) -> usize {
        self.lock_tables().active_sessions.len()
    }

    /// Drop expired pairings silently and expired sessions through the revoke
    /// path. Runs on a timer; every invocation is idempotent.
    pub async fn cleanup_expired(&self) {
        let now = Utc::now();

        let expired_sessions: Vec<String> = {
            let mut tables = self.lock_tables();

            tables.pending_pairings.retain(|code, pairing| {
                let keep = now <= pairing.expires_at;
                if !keep {
                    tracing::debug!("swept expired pairing {code}");
                }
                keep
            });

            let expired: Vec<String> = tables
                .active_sessions
                .iter()
                .filter(|(_, session)| now > session.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                tables.active_sessions.remove(id);
            }
            expired
        };

        for session_id in expired_sessions {
            if let Err(err) = self.vault.lock().await {
                tracing::warn!("vault lock on expiry sweep failed: {err}");
            }
            tracing::info!("swept expired session {session_id}");
        }
    }

    /// Approver shutdown: drop everything and lock the vault.
    pub async fn shutdown(&self) {
        let had_sessions = {
            let mut tables = self.lock_tables();
            tables.pending_pairings.clear();
            let had = !tables.active_sessions.is_empty();
            tables.active_sessions.clear();
            had
        };

        if had_sessions {
            if let Err(err) = self.vault.lock().await {
                tracing::warn!("vault lock on shutdown failed: {err}");
            }
        }
        tracing::info!("pairing manager shut down");
    }
}
