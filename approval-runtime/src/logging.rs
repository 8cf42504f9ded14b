//! Subscriber setup with a secret-shaped-record guard.
//!
//! Every formatted record passes through [`looks_sensitive`] before it
//! reaches the sink; anything resembling `password=...`, `"token":`, etc. is
//! replaced wholesale. Coarse on purpose — losing a log line is cheaper than
//! leaking a credential.

use std::io::{self, Write};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Tokens that mark a record as potentially carrying secret material when
/// followed by `=` or quoted as a JSON key.
const SENSITIVE_TOKENS: &[&str] = &[
    "password", "passwd", "pwd", "secret", "token", "key", "credential", "auth",
];

/// True when a formatted record looks like it embeds a secret value.
pub fn looks_sensitive(record: &str) -> bool {
    let lower = record.to_ascii_lowercase();
    SENSITIVE_TOKENS.iter().any(|tok| {
        lower.contains(&format!("{tok}=")) || lower.contains(&format!("\"{tok}\""))
    })
}

/// `MakeWriter` wrapping stdout with the sensitive-record guard.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuardedStdout;

pub struct GuardedWriter<W: Write> {
    inner: W,
}

impl<W: Write> Write for GuardedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let record = String::from_utf8_lossy(buf);
        if looks_sensitive(&record) {
            self.inner
                .write_all(b"[record withheld: contained secret-shaped content]\n")?;
        } else {
            self.inner.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for GuardedStdout {
    type Writer = GuardedWriter<io::Stdout>;

    fn make_writer(&'a self) -> Self::Writer {
        GuardedWriter {
            inner: io::stdout(),
        }
    }
}

/// Initialize the process-wide subscriber. `RUST_LOG` overrides the default
/// `info` level. Safe to call once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(GuardedStdout)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_assignment_and_json_key_forms() {
        assert!(looks_sensitive("unlock failed: password=hunter2"));
        assert!(looks_sensitive("body was {\"password\": \"x\"}"));
        assert!(looks_sensitive("TOKEN=abc123"));
        assert!(looks_sensitive("secret=s3cr3t"));
        assert!(looks_sensitive("api_key=sk-live-abc123"));
        assert!(looks_sensitive("payload {\"key\": \"...\"}"));
    }

    #[test]
    fn allows_ordinary_mentions() {
        assert!(!looks_sensitive("prompting for master password"));
        assert!(!looks_sensitive("vault unlocked, session token stored"));
        assert!(!looks_sensitive("pairing 847293 created for Flight Agent"));
    }

    #[test]
    fn writer_withholds_flagged_records() {
        let mut sink = Vec::new();
        {
            let mut writer = GuardedWriter { inner: &mut sink };
            writer.write_all(b"INFO password=hunter2\n").unwrap();
        }
        let written = String::from_utf8(sink).unwrap();
        assert!(!written.contains("hunter2"));
        assert!(written.contains("withheld"));
    }
}
