//! HTTP routes.
//!
//! The webhook endpoint follows the processor's acknowledgment contract:
//! anything we will never handle differently on redelivery (validation
//! failures, unknown event types) is answered 200 so the processor stops
//! retrying, while store failures are answered 500 to request a retry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use paysync_recon::{OrderId, ReconError};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/ipn", post(receive_webhook))
        .route("/orders/{id}/agreement", post(establish_agreement))
        .route("/orders/{id}/received", post(order_received))
        .route("/orders/{id}/charge", post(charge_order))
        .route("/admin/capability/recheck", post(recheck_capability))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Processor notification endpoint. The body is the raw URL-encoded
/// payload, passed through untouched so field ordering and encoding stay
/// exactly as delivered.
async fn receive_webhook(State(state): State<AppState>, body: String) -> Response {
    match state.service.handle_webhook(&body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) if err.is_acknowledgeable() => {
            tracing::warn!(error = %err, "notification acknowledged without effect");
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "notification processing failed; retry requested");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgreementRequest {
    token: String,
}

#[derive(Debug, Serialize)]
struct AgreementResponse {
    billing_agreement_id: String,
}

/// Checkout-completion hook: exchange the approved checkout token for a
/// billing agreement and store its id on the order.
async fn establish_agreement(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AgreementRequest>,
) -> Result<Json<AgreementResponse>, ApiError> {
    let billing_agreement_id = state
        .service
        .establish_billing_agreement(OrderId(id), &request.token)
        .await?;
    Ok(Json(AgreementResponse { billing_agreement_id }))
}

/// Browser-redirect hook: the customer landed on the order-received page.
async fn order_received(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.service.order_received(OrderId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ChargeRequest {
    profile_id: String,
}

/// Scheduled-charge trigger, called by the external scheduler once per
/// billing cycle.
async fn charge_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ChargeRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .process_renewal_payment(OrderId(id), &request.profile_id)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
struct CapabilityResponse {
    reference_transactions_enabled: bool,
}

/// Admin action: re-probe reference-transaction capability, bypassing the
/// cache.
async fn recheck_capability(
    State(state): State<AppState>,
) -> Result<Json<CapabilityResponse>, ApiError> {
    let enabled = state.service.recheck_capability().await?;
    Ok(Json(CapabilityResponse {
        reference_transactions_enabled: enabled,
    }))
}

/// Engine errors mapped onto HTTP statuses.
struct ApiError(ReconError);

impl From<ReconError> for ApiError {
    fn from(err: ReconError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ReconError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconError::Api { .. } => StatusCode::BAD_GATEWAY,
            ReconError::Transport(_) => StatusCode::BAD_GATEWAY,
            ReconError::Store(_) | ReconError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %self.0, status = %status, "request failed");
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
