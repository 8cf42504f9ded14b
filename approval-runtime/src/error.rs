use std::fmt;

/// Errors returned by broker operations.
///
/// Variants that cross the wire render exactly the stable peer-visible
/// message for their category; internal causes stay in the logs.
#[derive(Debug)]
pub enum BrokerError {
    /// Malformed or incomplete request body.
    BadRequest(String),
    /// Unknown pairing code.
    InvalidPairing,
    /// Pairing code past its expiry.
    ExpiredPairing,
    /// SPAKE2 completion failed. Deliberately carries no detail: the peer
    /// must not learn whether the password was wrong or the element malformed.
    PakeFailed,
    /// Unknown session id.
    InvalidSession,
    /// Session past its expiry.
    ExpiredSession,
    /// AEAD failure, truncation, or malformed payload JSON. One message for
    /// all of them so the peer learns nothing structural.
    DecryptionFailed,
    /// Request timestamp outside the replay window, or a reused nonce.
    Replay(String),
    /// Vault has no login item for the requested domain.
    NotFound(String),
    /// Vault record missing a username or password.
    IncompleteRecord(String),
    /// Vault driver failure (sanitized).
    Vault(String),
    /// HTTP transport failure (client side).
    Http(String),
    /// Operation exceeded its deadline.
    Timeout(String),
    /// Audit log or other local storage failure.
    Storage(String),
    /// An API was used out of order (engine state machine, cleared secret).
    State(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::BadRequest(msg) => write!(f, "{msg}"),
            BrokerError::InvalidPairing => write!(f, "Invalid pairing code"),
            BrokerError::ExpiredPairing => write!(f, "Pairing code expired"),
            BrokerError::PakeFailed => write!(f, "PAKE exchange failed"),
            BrokerError::InvalidSession => write!(f, "Invalid or expired session"),
            BrokerError::ExpiredSession => write!(f, "Session expired"),
            BrokerError::DecryptionFailed => write!(f, "Decryption failed"),
            BrokerError::Replay(msg) => write!(f, "{msg}"),
            BrokerError::NotFound(domain) => write!(f, "No credential found for {domain}"),
            BrokerError::IncompleteRecord(what) => write!(f, "Incomplete credential ({what})"),
            BrokerError::Vault(msg) => write!(f, "Vault access failed: {msg}"),
            BrokerError::Http(msg) => write!(f, "http error: {msg}"),
            BrokerError::Timeout(msg) => write!(f, "timed out: {msg}"),
            BrokerError::Storage(msg) => write!(f, "storage error: {msg}"),
            BrokerError::State(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

pub type Result<T> = std::result::Result<T, BrokerError>;
