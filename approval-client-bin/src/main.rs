//! Terminal approval client.
//!
//! Runs the approval HTTP server and owns the human side of the protocol:
//! shows pairing codes as agents initiate, prompts for the code plus master
//! password (no echo), and asks Y/N on every credential request — never for a
//! password after pairing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, oneshot};

use approval_runtime::audit::AuditLog;
use approval_runtime::bitwarden::BitwardenCli;
use approval_runtime::pairing::{
    ApprovalDecision, ApprovalHandler, PairingManager, PairingState, SessionSummary,
};
use approval_runtime::util::constant_time_str_eq;
use approval_runtime::vault::{MemoryVault, VaultDriver};
use approval_runtime::{approval_api, logging, reaper};

#[derive(Parser, Debug)]
#[command(name = "approval-client", about = "Credential approval client")]
struct Args {
    /// Address to bind the approval server on.
    #[arg(long, default_value = approval_runtime::DEFAULT_BIND_ADDR)]
    bind: SocketAddr,

    /// Path to the Bitwarden CLI executable.
    #[arg(long, default_value = "bw")]
    bw_path: String,

    /// Use an in-memory demo vault instead of the Bitwarden CLI.
    /// Master password "demo", one login for "example.com".
    #[arg(long)]
    demo_vault: bool,

    /// Audit log file for credential access events.
    #[arg(long, default_value = "credential_audit.log")]
    audit_log: std::path::PathBuf,
}

/// What the interactive loop needs to act on.
enum UiEvent {
    Pairing(PairingState),
    Approval {
        session: SessionSummary,
        domain: String,
        reason: String,
        answer: oneshot::Sender<bool>,
    },
}

/// Handler bridging manager callbacks onto the terminal loop.
struct ConsoleApprover {
    events: mpsc::UnboundedSender<UiEvent>,
}

#[async_trait::async_trait]
impl ApprovalHandler for ConsoleApprover {
    fn on_pairing_created(&self, pairing: &PairingState) {
        let _ = self.events.send(UiEvent::Pairing(pairing.clone()));
    }

    async fn on_credential_request(
        &self,
        session: &SessionSummary,
        domain: &str,
        reason: &str,
    ) -> ApprovalDecision {
        let (answer_tx, answer_rx) = oneshot::channel();
        let sent = self.events.send(UiEvent::Approval {
            session: session.clone(),
            domain: domain.to_string(),
            reason: reason.to_string(),
            answer: answer_tx,
        });

        // Default deny if the terminal loop is gone.
        let approved = match sent {
            Ok(()) => answer_rx.await.unwrap_or(false),
            Err(_) => false,
        };
        ApprovalDecision {
            approved,
            reason: None,
        }
    }
}

fn read_line(prompt: &str) -> std::io::Result<String> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn handle_pairing(manager: &PairingManager, pairing: PairingState) {
    println!();
    println!("=== New pairing request ===");
    println!("  Agent:        {} ({})", pairing.agent_name, pairing.agent_id);
    println!("  Pairing code: {}", pairing.pairing_code);
    println!();

    let typed = match tokio::task::spawn_blocking(|| read_line("Enter the pairing code: ")).await {
        Ok(Ok(line)) => line,
        _ => return,
    };
    if !constant_time_str_eq(&typed, &pairing.pairing_code) {
        println!("Code mismatch - ignoring");
        return;
    }

    let password = match tokio::task::spawn_blocking(|| {
        rpassword::prompt_password("Vault master password: ")
    })
    .await
    {
        Ok(Ok(password)) if !password.is_empty() => password,
        Ok(Ok(_)) => {
            println!("Password required");
            return;
        }
        _ => return,
    };

    if manager.mark_user_entered_code(&typed, password).await {
        println!("Pairing accepted - vault unlocked, waiting for the agent to finish");
    } else {
        println!("Pairing failed (wrong password or expired code)");
    }
}

async fn handle_approval(
    session: SessionSummary,
    domain: String,
    reason: String,
    answer: oneshot::Sender<bool>,
) {
    println!();
    println!("=== Credential request ===");
    println!("  Agent:  {} ({})", session.agent_name, session.agent_id);
    println!("  Domain: {domain}");
    println!("  Reason: {reason}");
    println!();

    let approved = matches!(
        tokio::task::spawn_blocking(|| read_line("Approve? [y/N]: ")).await,
        Ok(Ok(line)) if line.eq_ignore_ascii_case("y") || line.eq_ignore_ascii_case("yes")
    );
    println!("{}", if approved { "Approved" } else { "Denied" });
    let _ = answer.send(approved);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let vault: Arc<dyn VaultDriver> = if args.demo_vault {
        tracing::warn!("using in-memory demo vault; nothing here is real");
        Arc::new(MemoryVault::new("demo").with_login("example.com", "demo-user", "demo-pass"))
    } else {
        let cli = BitwardenCli::with_path(&args.bw_path);
        cli.verify_installed()
            .await
            .context("Bitwarden CLI not usable")?;
        Arc::new(cli)
    };

    let audit = AuditLog::open(&args.audit_log)
        .with_context(|| format!("cannot open audit log {}", args.audit_log.display()))?;
    let manager = Arc::new(PairingManager::new(vault).with_audit(audit));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    manager.set_handler(Arc::new(ConsoleApprover { events: events_tx }));

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("cannot bind {}", args.bind))?;
    let app = approval_api::router(manager.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("server error: {err}");
        }
    });

    let sweeper = reaper::spawn(manager.clone(), reaper::DEFAULT_SWEEP_INTERVAL);

    println!("Credential approval client");
    println!("Listening on {}", args.bind);
    println!("Waiting for pairing requests... (Ctrl-C to quit)");

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(UiEvent::Pairing(pairing)) => handle_pairing(&manager, pairing).await,
                Some(UiEvent::Approval { session, domain, reason, answer }) => {
                    handle_approval(session, domain, reason, answer).await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
        }
    }

    sweeper.abort();
    server.abort();
    manager.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn default_bind_is_loopback() {
        let args = Args::parse_from(["approval-client"]);
        assert!(args.bind.ip().is_loopback());
        assert_eq!(args.bind.port(), 5000);
    }
}
