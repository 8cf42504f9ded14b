//! Vault driver abstraction.
//!
//! The broker only ever touches a vault through this surface: unlock with a
//! master password to obtain an opaque session token, search items with that
//! token, lock. Any backend (subprocess CLI, library, HTTP) can sit behind
//! it; [`MemoryVault`] is the in-process implementation used by headless
//! tests and demo mode.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Type tag vaults use for login records (Bitwarden: `type == 1`).
pub const ITEM_TYPE_LOGIN: u8 = 1;

/// Lock state reported by a vault driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultStatus {
    Unauthenticated,
    Locked,
    Unlocked,
}

/// Login portion of a vault item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VaultLogin {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The subset of a vault record the broker reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: u8,
    #[serde(default)]
    pub login: Option<VaultLogin>,
}

impl VaultItem {
    pub fn is_login(&self) -> bool {
        self.item_type == ITEM_TYPE_LOGIN
    }
}

/// Capability set the broker depends on.
///
/// `unlock` is the only operation that ever sees the master password, and the
/// returned token — never the password — is what sessions carry.
#[async_trait]
pub trait VaultDriver: Send + Sync {
    /// Unlock the vault, returning an opaque session token.
    async fn unlock(&self, master_password: &str) -> Result<String>;

    /// Search for items matching `search` using a token from [`unlock`](Self::unlock).
    async fn list_items(&self, search: &str, session_token: &str) -> Result<Vec<VaultItem>>;

    /// Lock the vault, invalidating outstanding tokens.
    async fn lock(&self) -> Result<()>;

    /// Current lock state.
    async fn status(&self) -> Result<VaultStatus>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory driver
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic in-process vault for tests and demo mode.
pub struct MemoryVault {
    master_password: String,
    items: Vec<VaultItem>,
    issued_tokens: Mutex<HashSet<String>>,
}

impl MemoryVault {
    pub fn new(master_password: impl Into<String>) -> Self {
        Self {
            master_password: master_password.into(),
            items: Vec::new(),
            issued_tokens: Mutex::new(HashSet::new()),
        }
    }

    /// Add a login record. `name` doubles as the search key (domain).
    pub fn with_login(
        mut self,
        name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.items.push(VaultItem {
            id: format!("item-{}", self.items.len() + 1),
            name,
            item_type: ITEM_TYPE_LOGIN,
            login: Some(VaultLogin {
                username: Some(username.into()),
                password: Some(password.into()),
            }),
        });
        self
    }

    /// Add an arbitrary record, e.g. a secure note that should never match a
    /// login search.
    pub fn with_item(mut self, item: VaultItem) -> Self {
        self.items.push(item);
        self
    }
}

#[async_trait]
impl VaultDriver for MemoryVault {
    async fn unlock(&self, master_password: &str) -> Result<String> {
        if master_password != self.master_password {
            return Err(BrokerError::Vault("invalid master password".into()));
        }
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.issued_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone());
        Ok(token)
    }

    async fn list_items(&self, search: &str, session_token: &str) -> Result<Vec<VaultItem>> {
        let tokens = self
            .issued_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !tokens.contains(session_token) {
            return Err(BrokerError::Vault("vault is locked".into()));
        }
        let needle = search.to_ascii_lowercase();
        Ok(self
            .items
            .iter()
            .filter(|item| item.name.to_ascii_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn lock(&self) -> Result<()> {
        self.issued_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    async fn status(&self) -> Result<VaultStatus> {
        let unlocked = !self
            .issued_tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        Ok(if unlocked {
            VaultStatus::Unlocked
        } else {
            VaultStatus::Locked
        })
    }
}
