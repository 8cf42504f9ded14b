//! Append-only audit trail for credential access events.
//!
//! Records who asked for what and what happened — never credential values.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::{BrokerError, Result};
use crate::logging;

/// Error text is clipped to this length before it reaches the log.
const MAX_ERROR_LEN: usize = 200;

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit file in append mode, owner-only on unix.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| BrokerError::Storage(format!("open audit log: {err}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request(&self, agent_id: &str, domain: &str, reason: &str) {
        self.write_line(&format!(
            "REQUEST | agent={agent_id} | domain={domain} | reason={reason}"
        ));
    }

    pub fn denied(&self, agent_id: &str, domain: &str) {
        self.write_line(&format!("DENIED | agent={agent_id} | domain={domain}"));
    }

    pub fn success(&self, agent_id: &str, domain: &str) {
        self.write_line(&format!("SUCCESS | agent={agent_id} | domain={domain}"));
    }

    pub fn not_found(&self, agent_id: &str, domain: &str) {
        self.write_line(&format!("NOT_FOUND | agent={agent_id} | domain={domain}"));
    }

    pub fn error(&self, agent_id: &str, domain: &str, error: &str) {
        let clipped: String = error.chars().take(MAX_ERROR_LEN).collect();
        self.write_line(&format!(
            "ERROR | agent={agent_id} | domain={domain} | error={clipped}"
        ));
    }

    fn write_line(&self, line: &str) {
        // Belt and braces: an audit line must never carry secret material.
        let line = if logging::looks_sensitive(line) {
            "WITHHELD | record contained secret-shaped content"
        } else {
            line
        };
        let stamped = format!("{} | {line}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = file.write_all(stamped.as_bytes()) {
            tracing::warn!("audit write failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_lifecycle_events_without_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let audit = AuditLog::open(&path).unwrap();

        audit.request("flight-001", "aa.com", "Login to American Airlines");
        audit.denied("flight-001", "aa.com");
        audit.success("flight-001", "aa.com");
        audit.not_found("flight-001", "delta.com");
        audit.error("flight-001", "aa.com", &"x".repeat(500));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("REQUEST | agent=flight-001 | domain=aa.com"));
        assert!(lines[1].contains("DENIED"));
        assert!(lines[2].contains("SUCCESS"));
        assert!(lines[3].contains("NOT_FOUND | agent=flight-001 | domain=delta.com"));
        // Error text clipped to 200 chars.
        assert!(lines[4].len() < 300);
    }

    #[test]
    fn withholds_secret_shaped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let audit = AuditLog::open(&path).unwrap();

        audit.error("a1", "aa.com", "driver said password=hunter2");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("hunter2"));
        assert!(contents.contains("WITHHELD"));
    }
}
