//! Core runtime for the credential approval service.
//!
//! Brokers secrets from a local password vault to autonomous agents with a
//! human approval step on every release. A weak out-of-band pairing code is
//! bound to a strong mutually-authenticated channel via SPAKE2; the master
//! password unlocks the vault exactly once, at pairing time, and only the
//! resulting vault token is retained for the session's lifetime.

pub mod api_types;
pub mod approval_api;
pub mod audit;
pub mod bitwarden;
pub mod credential;
pub mod error;
pub mod logging;
pub mod pairing;
pub mod pake;
pub mod rate_limit;
pub mod reaper;
pub mod util;
pub mod vault;

pub use credential::SecureCredential;
pub use error::{BrokerError, Result};
pub use pairing::{
    ApprovalDecision, ApprovalHandler, AutoApprover, CredentialOutcome, ExchangeOutcome,
    PairingManager, PairingState, SessionStatus, SessionSummary,
};
pub use pake::{PakeChannel, Role};
pub use vault::{MemoryVault, VaultDriver, VaultItem, VaultStatus};

/// Loopback-only by default; nothing here requires TLS on the local wire.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
