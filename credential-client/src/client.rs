//! HTTP client implementing the initiator half of the protocol.

use std::time::Duration;

use approval_runtime::api_types::{
    CredentialPayload, CredentialRequestBody, CredentialRequestPayload, CredentialResponseBody,
    ExchangeRequest, ExchangeResponse, InitiateRequest, InitiateResponse, RevokeRequest,
    SessionStatusResponse,
};
use approval_runtime::pake::{PakeChannel, Role};
use approval_runtime::util::rfc3339;
use approval_runtime::{BrokerError, Result, SecureCredential};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::StatusCode;

use crate::response::CredentialResponse;

/// Cadence of `pairing/exchange` polls while waiting on the human.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default time to wait for the human to enter the code.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(60);
/// Plain API calls (initiate, revoke, status) should answer promptly.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Credential requests block on a human; be generous.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct CredentialClient {
    server_url: String,
    http: reqwest::Client,
    session_id: Option<String>,
    channel: Option<PakeChannel>,
}

impl CredentialClient {
    /// Client for an approval server, e.g. `http://127.0.0.1:5000`.
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BrokerError::Http(format!("client build failed: {err}")))?;
        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            http,
            session_id: None,
            channel: None,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    /// Pair with the approval server.
    ///
    /// Requests a pairing code, starts the SPAKE2 initiator, then polls
    /// `pairing/exchange` every two seconds until the human enters the code
    /// (202 while waiting) or `timeout` elapses. On 200 the exchange
    /// completes and the session is stored. Returns the pairing code — the
    /// human sees it through the approver, not through this value.
    pub async fn pair(
        &mut self,
        agent_id: &str,
        agent_name: &str,
        timeout: Duration,
    ) -> Result<String> {
        tracing::info!("starting pairing for {agent_name} ({agent_id})");

        let response = self
            .http
            .post(self.url("/pairing/initiate"))
            .json(&InitiateRequest {
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
            })
            .send()
            .await
            .map_err(|err| {
                BrokerError::Http(format!(
                    "cannot reach approval server at {}: {err}",
                    self.server_url
                ))
            })?;
        if !response.status().is_success() {
            return Err(BrokerError::Http(format!(
                "pairing initiate failed: HTTP {}",
                response.status()
            )));
        }
        let initiate: InitiateResponse = response
            .json()
            .await
            .map_err(|err| BrokerError::Http(format!("bad initiate response: {err}")))?;
        tracing::info!("pairing code issued, waiting for user entry");

        let mut channel = PakeChannel::new(Role::Initiator);
        let pake_message = BASE64.encode(channel.start(&initiate.pairing_code)?);
        let exchange = ExchangeRequest {
            pairing_code: initiate.pairing_code.clone(),
            pake_message,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self
                .http
                .post(self.url("/pairing/exchange"))
                .json(&exchange)
                .send()
                .await
                .map_err(|err| BrokerError::Http(format!("exchange poll failed: {err}")))?;

            match response.status() {
                StatusCode::ACCEPTED => {
                    if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                        return Err(BrokerError::Timeout(format!(
                            "pairing not completed within {}s (user did not enter the code)",
                            timeout.as_secs()
                        )));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                StatusCode::OK => {
                    let exchange: ExchangeResponse = response
                        .json()
                        .await
                        .map_err(|err| BrokerError::Http(format!("bad exchange response: {err}")))?;
                    let responder = BASE64
                        .decode(exchange.pake_message.trim())
                        .map_err(|_| BrokerError::PakeFailed)?;
                    channel.finish(&responder)?;

                    tracing::info!("pairing complete, session {}", exchange.session_id);
                    self.session_id = Some(exchange.session_id);
                    self.channel = Some(channel);
                    return Ok(initiate.pairing_code);
                }
                status => {
                    let detail = response
                        .json::<serde_json::Value>()
                        .await
                        .ok()
                        .and_then(|v| v["error"].as_str().map(str::to_string))
                        .unwrap_or_else(|| format!("HTTP {status}"));
                    return Err(BrokerError::Http(format!("pairing rejected: {detail}")));
                }
            }
        }
    }

    /// Request a credential for `domain`, blocking on human approval.
    pub async fn request_credential(
        &self,
        domain: &str,
        reason: &str,
        agent_id: &str,
        agent_name: &str,
    ) -> Result<CredentialResponse> {
        let (session_id, channel) = self.established()?;

        let mut nonce_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_bytes);
        let payload = CredentialRequestPayload {
            domain: domain.to_string(),
            reason: reason.to_string(),
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            timestamp: rfc3339(Utc::now()),
            nonce: hex::encode(nonce_bytes),
        };
        let plaintext = serde_json::to_string(&payload)
            .map_err(|err| BrokerError::State(format!("request encoding failed: {err}")))?;
        let encrypted_payload = channel.encrypt(&plaintext)?;

        tracing::info!("requesting credential for {domain}");
        let response = self
            .http
            .post(self.url("/credential/request"))
            .timeout(APPROVAL_TIMEOUT)
            .json(&CredentialRequestBody {
                session_id: session_id.to_string(),
                encrypted_payload,
            })
            .send()
            .await
            .map_err(|err| BrokerError::Http(format!("credential request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(BrokerError::Http(format!(
                "credential request failed: HTTP {}",
                response.status()
            )));
        }

        let body: CredentialResponseBody = response
            .json()
            .await
            .map_err(|err| BrokerError::Http(format!("bad credential response: {err}")))?;

        match body.status.as_str() {
            "approved" => {
                let encrypted = body
                    .encrypted_payload
                    .ok_or(BrokerError::DecryptionFailed)?;
                let plaintext = channel.decrypt(&encrypted)?;
                let credential: CredentialPayload =
                    serde_json::from_str(&plaintext).map_err(|_| BrokerError::DecryptionFailed)?;

                tracing::info!("credential approved for {domain}");
                Ok(CredentialResponse::approved(SecureCredential::new(
                    credential.username.clone(),
                    credential.password.clone(),
                )))
            }
            "denied" => {
                tracing::warn!("credential denied for {domain}");
                Ok(CredentialResponse::denied(
                    body.error.unwrap_or_else(|| "User denied".into()),
                ))
            }
            _ => {
                let message = body.error.unwrap_or_else(|| "Unknown error".into());
                tracing::warn!("credential request error for {domain}: {message}");
                Ok(CredentialResponse::error(message))
            }
        }
    }

    /// Revoke the current session on the server and forget it locally.
    pub async fn revoke_session(&mut self) -> Result<()> {
        let (session_id, _) = self.established()?;

        let response = self
            .http
            .post(self.url("/session/revoke"))
            .json(&RevokeRequest {
                session_id: session_id.to_string(),
            })
            .send()
            .await
            .map_err(|err| BrokerError::Http(format!("revoke failed: {err}")))?;
        if !response.status().is_success() {
            return Err(BrokerError::Http(format!(
                "revoke failed: HTTP {}",
                response.status()
            )));
        }

        tracing::info!("session revoked");
        self.session_id = None;
        self.channel = None;
        Ok(())
    }

    /// Fetch the server's view of the current session; `None` once it is
    /// revoked or expired.
    pub async fn session_status(&self) -> Result<Option<SessionStatusResponse>> {
        let (session_id, _) = self.established()?;

        let response = self
            .http
            .get(self.url("/session/status"))
            .query(&[("session_id", session_id)])
            .send()
            .await
            .map_err(|err| BrokerError::Http(format!("status check failed: {err}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BrokerError::Http(format!(
                "status check failed: HTTP {}",
                response.status()
            )));
        }
        let status = response
            .json()
            .await
            .map_err(|err| BrokerError::Http(format!("bad status response: {err}")))?;
        Ok(Some(status))
    }

    fn established(&self) -> Result<(&str, &PakeChannel)> {
        match (&self.session_id, &self.channel) {
            (Some(session_id), Some(channel)) if channel.is_ready() => {
                Ok((session_id, channel))
            }
            _ => Err(BrokerError::State(
                "no established session; call pair() first".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_pairing_first() {
        let client = CredentialClient::new("http://127.0.0.1:1").unwrap();
        assert!(matches!(
            client.request_credential("aa.com", "r", "a", "A").await,
            Err(BrokerError::State(_))
        ));
        assert!(matches!(
            client.session_status().await,
            Err(BrokerError::State(_))
        ));

        let mut client = client;
        assert!(matches!(
            client.revoke_session().await,
            Err(BrokerError::State(_))
        ));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let client = CredentialClient::new("http://127.0.0.1:5000/").unwrap();
        assert_eq!(client.url("/health"), "http://127.0.0.1:5000/health");
    }
}
