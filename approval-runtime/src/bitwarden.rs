//! Bitwarden CLI vault driver.
//!
//! Shells out to the `bw` executable: `bw unlock <password> --raw` for the
//! session token, `bw list items --search <q> --session <token>` for reads,
//! `bw lock` to drop the unlock. The driver never keeps the master password;
//! it only passes it through to one subprocess invocation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{BrokerError, Result};
use crate::vault::{VaultDriver, VaultItem, VaultStatus};

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BitwardenCli {
    cli_path: String,
}

#[derive(Deserialize)]
struct CliStatus {
    status: String,
}

impl BitwardenCli {
    /// Driver over `bw` found on PATH.
    pub fn new() -> Self {
        Self::with_path("bw")
    }

    pub fn with_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Verify the CLI exists and the user is logged in (`bw login` done).
    /// Call once at startup; unlock still works without it but fails later
    /// with a less helpful message.
    pub async fn verify_installed(&self) -> Result<()> {
        let output = self
            .run(&["--version"], VERSION_TIMEOUT, "version check")
            .await?;
        if !output.status.success() {
            return Err(BrokerError::Vault(format!(
                "'{}' is not a working Bitwarden CLI",
                self.cli_path
            )));
        }
        tracing::debug!(
            "Bitwarden CLI version: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );

        if self.status().await? == VaultStatus::Unauthenticated {
            return Err(BrokerError::Vault(
                "not logged into Bitwarden CLI; run 'bw login' first".into(),
            ));
        }
        Ok(())
    }

    async fn run(
        &self,
        args: &[&str],
        timeout: Duration,
        what: &str,
    ) -> Result<std::process::Output> {
        let child = Command::new(&self.cli_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BrokerError::Vault(format!("failed to run '{}': {err}", self.cli_path)))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => Err(BrokerError::Vault(format!("{what} timed out"))),
            Ok(Err(err)) => Err(BrokerError::Vault(format!("{what} failed: {err}"))),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

impl Default for BitwardenCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VaultDriver for BitwardenCli {
    async fn unlock(&self, master_password: &str) -> Result<String> {
        let output = self
            .run(&["unlock", master_password, "--raw"], UNLOCK_TIMEOUT, "vault unlock")
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Invalid master password") {
                return Err(BrokerError::Vault("invalid master password".into()));
            }
            // Whatever bw printed may quote the command line; keep it out of
            // the error entirely.
            return Err(BrokerError::Vault("vault unlock failed".into()));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(BrokerError::Vault("unlock returned an empty session key".into()));
        }
        Ok(token)
    }

    async fn list_items(&self, search: &str, session_token: &str) -> Result<Vec<VaultItem>> {
        let output = self
            .run(
                &["list", "items", "--search", search, "--session", session_token],
                LIST_TIMEOUT,
                "item search",
            )
            .await?;

        if !output.status.success() {
            return Err(BrokerError::Vault("item search failed".into()));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| BrokerError::Vault(format!("unparseable CLI output: {err}")))
    }

    async fn lock(&self) -> Result<()> {
        let output = self.run(&["lock"], LOCK_TIMEOUT, "vault lock").await?;
        if !output.status.success() {
            return Err(BrokerError::Vault("vault lock failed".into()));
        }
        Ok(())
    }

    async fn status(&self) -> Result<VaultStatus> {
        let output = self.run(&["status"], STATUS_TIMEOUT, "status check").await?;
        if !output.status.success() {
            return Err(BrokerError::Vault("status check failed".into()));
        }

        let parsed: CliStatus = serde_json::from_slice(&output.stdout)
            .map_err(|err| BrokerError::Vault(format!("unparseable status output: {err}")))?;
        Ok(match parsed.status.as_str() {
            "unauthenticated" => VaultStatus::Unauthenticated,
            "unlocked" => VaultStatus::Unlocked,
            _ => VaultStatus::Locked,
        })
    }
}
