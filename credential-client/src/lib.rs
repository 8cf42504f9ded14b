//! Agent-side SDK for the credential approval service.
//!
//! Workflow:
//! 1. [`CredentialClient::pair`] initiates pairing and polls until the human
//!    enters the code in the approver; the SPAKE2 exchange then establishes
//!    an end-to-end encrypted session.
//! 2. [`CredentialClient::request_credential`] sends an encrypted request and
//!    blocks (generously) on the human's approval.
//! 3. Retrieved secrets arrive inside a [`SecureCredential`] that clears
//!    itself when dropped.

pub mod client;
pub mod response;

pub use approval_runtime::SecureCredential;
pub use client::CredentialClient;
pub use response::{CredentialResponse, CredentialStatus};
