//! Scoped container for retrieved secrets.

use std::fmt;

use zeroize::Zeroize;

use crate::error::{BrokerError, Result};

/// A retrieved username/password pair that guarantees clearing.
///
/// The backing storage is zeroized on [`clear`](Self::clear) and again on
/// drop as a backstop; accessors refuse to read a cleared credential.
pub struct SecureCredential {
    username: String,
    password: String,
    cleared: bool,
}

impl SecureCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            cleared: false,
        }
    }

    pub fn username(&self) -> Result<&str> {
        self.guard()?;
        Ok(&self.username)
    }

    pub fn password(&self) -> Result<&str> {
        self.guard()?;
        Ok(&self.password)
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Overwrite the backing storage. Idempotent.
    pub fn clear(&mut self) {
        if self.cleared {
            return;
        }
        self.username.zeroize();
        self.password.zeroize();
        self.cleared = true;
    }

    fn guard(&self) -> Result<()> {
        if self.cleared {
            Err(BrokerError::State("credential has been cleared".into()))
        } else {
            Ok(())
        }
    }
}

impl Drop for SecureCredential {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for SecureCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never render the contents.
        write!(
            f,
            "SecureCredential(status={})",
            if self.cleared { "cleared" } else { "active" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_work_until_cleared() {
        let mut cred = SecureCredential::new("user@example.com", "hunter2");
        assert_eq!(cred.username().unwrap(), "user@example.com");
        assert_eq!(cred.password().unwrap(), "hunter2");

        cred.clear();
        assert!(cred.is_cleared());
        assert!(cred.username().is_err());
        assert!(cred.password().is_err());

        // Idempotent.
        cred.clear();
        assert!(cred.is_cleared());
    }

    #[test]
    fn debug_never_shows_contents() {
        let cred = SecureCredential::new("user@example.com", "hunter2");
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("user@example.com"));
    }
}
