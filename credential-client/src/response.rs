//! Outcome of a credential request.

use approval_runtime::SecureCredential;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Human approved; `credential` is present.
    Approved,
    /// Human denied the request.
    Denied,
    /// The server reported an error (expired session, replay, vault miss...).
    Error,
}

#[derive(Debug)]
pub struct CredentialResponse {
    pub status: CredentialStatus,
    pub credential: Option<SecureCredential>,
    pub error_message: Option<String>,
}

impl CredentialResponse {
    pub(crate) fn approved(credential: SecureCredential) -> Self {
        Self {
            status: CredentialStatus::Approved,
            credential: Some(credential),
            error_message: None,
        }
    }

    pub(crate) fn denied(message: impl Into<String>) -> Self {
        Self {
            status: CredentialStatus::Denied,
            credential: None,
            error_message: Some(message.into()),
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            status: CredentialStatus::Error,
            credential: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == CredentialStatus::Approved
    }
}
