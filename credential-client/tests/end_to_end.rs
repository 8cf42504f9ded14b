//! SDK against a live approval server over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use approval_runtime::approval_api::router;
use approval_runtime::pairing::PairingManager;
use approval_runtime::vault::MemoryVault;
use credential_client::{CredentialClient, CredentialStatus};

const MASTER: &str = "correct horse battery staple";

async fn serve() -> (Arc<PairingManager>, String) {
    let vault = Arc::new(
        MemoryVault::new(MASTER).with_login("aa.com", "traveler@example.com", "hunter2"),
    );
    let manager = Arc::new(PairingManager::new(vault));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(manager.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (manager, format!("http://{addr}"))
}

/// Test approver that forwards the pairing code out of the callback (like a
/// human reading it off the screen) and answers requests with a fixed
/// decision.
struct ForwardingApprover {
    code_tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<String>>>,
    approve: bool,
}

#[async_trait::async_trait]
impl approval_runtime::ApprovalHandler for ForwardingApprover {
    fn on_pairing_created(&self, pairing: &approval_runtime::PairingState) {
        if let Some(tx) = self.code_tx.lock().unwrap().take() {
            let _ = tx.send(pairing.pairing_code.clone());
        }
    }

    async fn on_credential_request(
        &self,
        _session: &approval_runtime::SessionSummary,
        _domain: &str,
        _reason: &str,
    ) -> approval_runtime::ApprovalDecision {
        approval_runtime::ApprovalDecision {
            approved: self.approve,
            reason: None,
        }
    }
}

/// Wire up a forwarding approver and play the human: wait briefly, then enter
/// the pairing code and master password.
fn attach_human(manager: &Arc<PairingManager>, approve: bool) {
    let (code_tx, code_rx) = tokio::sync::oneshot::channel();
    manager.set_handler(Arc::new(ForwardingApprover {
        code_tx: std::sync::Mutex::new(Some(code_tx)),
        approve,
    }));

    let manager = manager.clone();
    tokio::spawn(async move {
        let code: String = code_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.mark_user_entered_code(&code, MASTER.into()).await);
    });
}

#[tokio::test]
async fn pair_poll_request_revoke() {
    let (manager, url) = serve().await;
    attach_human(&manager, true);

    let mut client = CredentialClient::new(&url).unwrap();
    let code = client
        .pair("flight-001", "Flight Agent", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(code.len(), 6);
    assert!(client.session_id().unwrap().starts_with("sess_"));

    let status = client.session_status().await.unwrap().unwrap();
    assert!(status.active);
    assert_eq!(status.agent_name, "Flight Agent");

    let response = client
        .request_credential("aa.com", "Login for booking", "flight-001", "Flight Agent")
        .await
        .unwrap();
    assert_eq!(response.status, CredentialStatus::Approved);
    let credential = response.credential.unwrap();
    assert_eq!(credential.username().unwrap(), "traveler@example.com");
    assert_eq!(credential.password().unwrap(), "hunter2");

    client.revoke_session().await.unwrap();
    assert!(client.session_id().is_none());
    assert_eq!(manager.active_session_count(), 0);
}

#[tokio::test]
async fn denial_is_reported_not_errored() {
    let (manager, url) = serve().await;
    attach_human(&manager, false);

    let mut client = CredentialClient::new(&url).unwrap();
    client
        .pair("flight-001", "Flight Agent", Duration::from_secs(30))
        .await
        .unwrap();

    let response = client
        .request_credential("aa.com", "Login for booking", "flight-001", "Flight Agent")
        .await
        .unwrap();
    assert_eq!(response.status, CredentialStatus::Denied);
    assert!(response.credential.is_none());
    assert_eq!(response.error_message.as_deref(), Some("User denied"));
}

#[tokio::test]
async fn pair_times_out_when_nobody_enters_the_code() {
    let (_manager, url) = serve().await;

    let mut client = CredentialClient::new(&url).unwrap();
    let result = client
        .pair("flight-001", "Flight Agent", Duration::from_secs(3))
        .await;
    assert!(matches!(
        result,
        Err(approval_runtime::BrokerError::Timeout(_))
    ));
    assert!(client.session_id().is_none());
}
