//! Axum surface for the approval service.
//!
//! Handlers are thin: decode, delegate to the [`PairingManager`], encode.
//! Manager errors on `pairing/*` become 400 bodies; on `credential/request`
//! they become a 200 `{"status":"error"}` envelope, mirroring how the agent
//! consumes them. Nothing here inspects secret material.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::api_types::{
    ApiError, CredentialRequestBody, CredentialResponseBody, ExchangeRequest, ExchangeResponse,
    HealthResponse, InitiateRequest, InitiateResponse, RevokeRequest, RevokeResponse,
    SessionStatusResponse,
};
use crate::pairing::{CredentialOutcome, ExchangeOutcome, PairingManager};
use crate::rate_limit;
use crate::util::rfc3339;

pub(crate) fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(manager): State<Arc<PairingManager>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        active_sessions: manager.active_session_count(),
    })
}

async fn pairing_initiate(
    State(manager): State<Arc<PairingManager>>,
    Json(req): Json<InitiateRequest>,
) -> impl IntoResponse {
    if req.agent_id.trim().is_empty() || req.agent_name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Missing agent_id or agent_name")
            .into_response();
    }

    let (pairing_code, expires_at) = manager.create_pairing(&req.agent_id, &req.agent_name);
    Json(InitiateResponse {
        pairing_code,
        expires_at: rfc3339(expires_at),
    })
    .into_response()
}

async fn pairing_exchange(
    State(manager): State<Arc<PairingManager>>,
    Json(req): Json<ExchangeRequest>,
) -> impl IntoResponse {
    if req.pairing_code.trim().is_empty() || req.pake_message.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Missing pairing_code or pake_message")
            .into_response();
    }

    match manager
        .exchange_pake_message(&req.pairing_code, &req.pake_message)
        .await
    {
        Ok(ExchangeOutcome::Waiting) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "waiting" })),
        )
            .into_response(),
        Ok(ExchangeOutcome::Established {
            session_id,
            responder_message_b64,
            agent_id,
        }) => Json(ExchangeResponse {
            session_id,
            pake_message: responder_message_b64,
            agent_id,
        })
        .into_response(),
        Err(err) => api_error(StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn credential_request(
    State(manager): State<Arc<PairingManager>>,
    Json(req): Json<CredentialRequestBody>,
) -> impl IntoResponse {
    if req.session_id.trim().is_empty() || req.encrypted_payload.trim().is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "Missing session_id or encrypted_payload",
        )
            .into_response();
    }

    let body = match manager
        .handle_credential_request(&req.session_id, &req.encrypted_payload)
        .await
    {
        Ok(CredentialOutcome::Approved { encrypted_payload }) => CredentialResponseBody {
            status: "approved".into(),
            encrypted_payload: Some(encrypted_payload),
            error: None,
        },
        Ok(CredentialOutcome::Denied { error }) => CredentialResponseBody {
            status: "denied".into(),
            encrypted_payload: None,
            error: Some(error),
        },
        Err(err) => CredentialResponseBody {
            status: "error".into(),
            encrypted_payload: None,
            error: Some(err.to_string()),
        },
    };
    Json(body).into_response()
}

async fn session_revoke(
    State(manager): State<Arc<PairingManager>>,
    Json(req): Json<RevokeRequest>,
) -> impl IntoResponse {
    if req.session_id.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Missing session_id").into_response();
    }

    manager.revoke_session(&req.session_id).await;
    Json(RevokeResponse {
        revoked: true,
        session_id: req.session_id,
    })
    .into_response()
}

#[derive(Deserialize)]
struct StatusQuery {
    session_id: Option<String>,
}

async fn session_status(
    State(manager): State<Arc<PairingManager>>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    let Some(session_id) = query.session_id.filter(|id| !id.trim().is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "Missing session_id parameter")
            .into_response();
    };

    match manager.get_session_status(&session_id) {
        Some(status) => Json(SessionStatusResponse {
            active: status.active,
            agent_name: status.agent_name,
            last_access: rfc3339(status.last_access),
            expires_at: rfc3339(status.expires_at),
        })
        .into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Session not found").into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build the approval API router.
///
/// Pairing endpoints answer immediately and get a short timeout;
/// `credential/request` deliberately has none — it holds the connection open
/// for as long as the human takes to decide.
pub fn router(manager: Arc<PairingManager>) -> Router {
    let pairing_routes = Router::new()
        .route("/pairing/initiate", post(pairing_initiate))
        .route("/pairing/exchange", post(pairing_exchange))
        .layer(TimeoutLayer::new(Duration::from_secs(15)))
        .layer(middleware::from_fn(rate_limit::pairing_rate_limit));

    let session_routes = Router::new()
        .route("/credential/request", post(credential_request))
        .route("/session/revoke", post(session_revoke))
        .route("/session/status", get(session_status))
        .layer(middleware::from_fn(rate_limit::session_rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(pairing_routes)
        .merge(session_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::AutoApprover;
    use crate::vault::MemoryVault;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let vault = Arc::new(MemoryVault::new("pw").with_login("aa.com", "traveler", "hunter2"));
        let manager = Arc::new(PairingManager::new(vault));
        manager.set_handler(Arc::new(AutoApprover { approve: true }));
        router(manager)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_sessions"], 0);
    }

    #[tokio::test]
    async fn initiate_requires_identity_fields() {
        let response = app()
            .oneshot(post_json(
                "/pairing/initiate",
                serde_json::json!({ "agent_id": "", "agent_name": "A1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn initiate_returns_code_and_expiry() {
        let response = app()
            .oneshot(post_json(
                "/pairing/initiate",
                serde_json::json!({ "agent_id": "a1", "agent_name": "A1" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        let code = json["pairing_code"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(json["expires_at"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn exchange_unknown_code_is_bad_request() {
        let response = app()
            .oneshot(post_json(
                "/pairing/exchange",
                serde_json::json!({ "pairing_code": "000000", "pake_message": "AAAA" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Invalid pairing code");
    }

    #[tokio::test]
    async fn revoke_missing_session_id_is_bad_request() {
        let response = app()
            .oneshot(post_json("/session/revoke", serde_json::json!({ "session_id": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn revoke_unknown_session_still_acknowledges() {
        let response = app()
            .oneshot(post_json(
                "/session/revoke",
                serde_json::json!({ "session_id": "sess_missing" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["revoked"], true);
        assert_eq!(json["session_id"], "sess_missing");
    }

    #[tokio::test]
    async fn status_requires_parameter_and_404s_unknown() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/session/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/session/status?session_id=sess_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn credential_request_with_unknown_session_is_error_status() {
        let response = app()
            .oneshot(post_json(
                "/credential/request",
                serde_json::json!({ "session_id": "sess_missing", "encrypted_payload": "AAAA" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "Invalid or expired session");
    }
}
