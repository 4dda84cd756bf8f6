//! HTTP surface for the report dispatcher
//!
//! Three endpoints: liveness, token-guarded transaction ingestion, and
//! the signature-verified ledger event webhook. All error bodies share
//! one shape and never carry another user's data.

use axum::body::Bytes;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth;
use crate::config::UserConfigStore;
use crate::ledger::LedgerGateway;
use crate::models::{DateRange, ReportKind, TransactionRequest};
use crate::notify::{append_budget_overview, format_transaction_message, Notifier, TransactionNotice};

const MAX_EVENT_DESCRIPTION_LEN: usize = 255;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
            data,
            code: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>, code: u16) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
            data: None,
            code: Some(code),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn reject(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiResponse>) {
    (status, Json(ApiResponse::error(message, status.as_u16())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<UserConfigStore>,
    pub ledger: Arc<dyn LedgerGateway>,
    pub notifier: Arc<dyn Notifier>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Transaction Ingestion
/// =============================

async fn add_transaction(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(mut request): Json<TransactionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

    let profile = match auth::authenticate(
        &state.store,
        header(&headers, "x-user-id"),
        header(&headers, "authorization"),
    ) {
        Ok(profile) => profile,
        Err(failure) => {
            warn!(request_id = %request_id, reason = ?failure, "Ingestion request rejected");
            let status = StatusCode::from_u16(failure.status())
                .unwrap_or(StatusCode::UNAUTHORIZED);
            return reject(status, failure.message());
        }
    };

    if let Err(e) = request.validate() {
        warn!(request_id = %request_id, user_id = %profile.user_id, error = %e, "Invalid transaction");
        return reject(StatusCode::BAD_REQUEST, e.to_string());
    }

    info!(
        request_id = %request_id,
        user_id = %profile.user_id,
        amount = request.amount,
        "Creating transaction"
    );

    match state.ledger.add_transaction(&profile.ledger, &request).await {
        Ok(result) => (
            StatusCode::CREATED,
            Json(ApiResponse::success("交易创建成功", Some(result))),
        ),
        Err(e) => {
            warn!(request_id = %request_id, user_id = %profile.user_id, error = %e, "Transaction create failed");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "交易创建失败")
        }
    }
}

/// =============================
/// Ledger Event Webhook
/// =============================

#[derive(Debug, Deserialize)]
struct LedgerEventPayload {
    trigger: Option<String>,
    content: Option<LedgerEventContent>,
}

#[derive(Debug, Deserialize)]
struct LedgerEventContent {
    #[serde(default)]
    transactions: Vec<LedgerEventSplit>,
}

#[derive(Debug, Deserialize)]
struct LedgerEventSplit {
    description: Option<String>,
    /// Arrives as either a JSON number or a string
    amount: Option<Value>,
    category_name: Option<String>,
    budget_name: Option<String>,
}

/// Check the event payload and distill it into a notice. Returns a
/// human-readable rejection on malformed input.
fn validate_event(payload: &LedgerEventPayload) -> std::result::Result<TransactionNotice, String> {
    let trigger = payload
        .trigger
        .as_deref()
        .ok_or("missing required field: trigger")?;
    if !matches!(trigger, "STORE_TRANSACTION" | "UPDATE_TRANSACTION") {
        return Err(format!("invalid trigger value: {}", trigger));
    }

    let splits = payload
        .content
        .as_ref()
        .map(|content| content.transactions.as_slice())
        .unwrap_or_default();
    let split = splits.first().ok_or("at least one transaction is required")?;

    let description = split.description.clone().unwrap_or_else(|| "无描述".to_string());
    if description.chars().count() > MAX_EVENT_DESCRIPTION_LEN {
        return Err(format!(
            "description too long (max {} characters)",
            MAX_EVENT_DESCRIPTION_LEN
        ));
    }

    let amount = match &split.amount {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => {
            if s.parse::<f64>().is_err() {
                return Err("amount must be a number".to_string());
            }
            s.clone()
        }
        Some(_) => return Err("amount must be a number".to_string()),
        None => "0".to_string(),
    };

    Ok(TransactionNotice {
        trigger: trigger.to_string(),
        description,
        amount,
        category: split.category_name.clone().unwrap_or_else(|| "无分类".to_string()),
        budget: split.budget_name.clone().unwrap_or_else(|| "无预算".to_string()),
    })
}

async fn ledger_webhook(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse>) {
    let profile = match state.store.load(&user_id) {
        Ok(profile) => profile,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Webhook for unknown user");
            return reject(StatusCode::NOT_FOUND, "Unknown user");
        }
    };

    let Some(signature) = header(&headers, "signature") else {
        return reject(StatusCode::UNAUTHORIZED, "Signature header is required");
    };

    let mut secrets = vec![profile.notification.webhook_secret.as_str()];
    if let Some(rotation) = profile.notification.webhook_secret_update.as_deref() {
        secrets.push(rotation);
    }
    if !auth::verify_signature(signature, &body, &secrets) {
        warn!(user_id = %user_id, "Webhook signature verification failed");
        return reject(StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    let payload: LedgerEventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return reject(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)),
    };

    let notice = match validate_event(&payload) {
        Ok(notice) => notice,
        Err(reason) => return reject(StatusCode::BAD_REQUEST, reason),
    };

    let mut message = format_transaction_message(&notice);

    // Current-month budget standing rides along with the notification;
    // a budget fetch failure degrades to the bare message.
    let month = DateRange::for_period(ReportKind::Monthly, chrono::Local::now().date_naive());
    match state.ledger.budget_overview(&profile.ledger, month).await {
        Ok(budgets) => append_budget_overview(&mut message, &budgets),
        Err(e) => warn!(user_id = %user_id, error = %e, "Budget overview unavailable"),
    }

    info!(user_id = %user_id, trigger = %notice.trigger, "Ledger event accepted");

    match state.notifier.send(&profile.notification, &message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                "Webhook processed",
                Some(serde_json::json!({ "message": message })),
            )),
        ),
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Notification delivery failed");
            reject(StatusCode::BAD_GATEWAY, "notification delivery failed")
        }
    }
}

/// =============================
/// Router / Server Startup
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/transactions", post(add_transaction))
        .route("/webhook/:user_id", post(ledger_webhook))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start_server(
    state: ApiState,
    host: &str,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;

    info!("API server listening on http://{}:{}", host, port);

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: &str) -> LedgerEventPayload {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_validate_event_happy_path() {
        let notice = validate_event(&payload(
            r#"{
                "trigger": "STORE_TRANSACTION",
                "content": { "transactions": [{
                    "description": "午餐",
                    "amount": "32.5",
                    "category_name": "餐饮"
                }]}
            }"#,
        ))
        .unwrap();

        assert_eq!(notice.trigger, "STORE_TRANSACTION");
        assert_eq!(notice.description, "午餐");
        assert_eq!(notice.amount, "32.5");
        assert_eq!(notice.category, "餐饮");
        assert_eq!(notice.budget, "无预算");
    }

    #[test]
    fn test_validate_event_numeric_amount() {
        let notice = validate_event(&payload(
            r#"{
                "trigger": "UPDATE_TRANSACTION",
                "content": { "transactions": [{ "amount": 12.5 }] }
            }"#,
        ))
        .unwrap();
        assert_eq!(notice.amount, "12.5");
        assert_eq!(notice.description, "无描述");
    }

    #[test]
    fn test_validate_event_rejections() {
        assert!(validate_event(&payload(r#"{ "content": { "transactions": [{}] } }"#)).is_err());
        assert!(validate_event(&payload(r#"{ "trigger": "DELETE_TRANSACTION" }"#)).is_err());
        assert!(
            validate_event(&payload(
                r#"{ "trigger": "STORE_TRANSACTION", "content": { "transactions": [] } }"#
            ))
            .is_err()
        );
        assert!(
            validate_event(&payload(
                r#"{ "trigger": "STORE_TRANSACTION",
                     "content": { "transactions": [{ "amount": "not-a-number" }] } }"#
            ))
            .is_err()
        );

        let long = "x".repeat(256);
        assert!(validate_event(&payload(&format!(
            r#"{{ "trigger": "STORE_TRANSACTION",
                 "content": {{ "transactions": [{{ "description": "{}" }}] }} }}"#,
            long
        )))
        .is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(ApiResponse::success("done", None)).unwrap();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["message"], "done");
        assert!(ok.get("code").is_none());
        assert!(ok.get("timestamp").is_some());

        let err = serde_json::to_value(ApiResponse::error("Invalid API token", 403)).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["code"], 403);
        assert_eq!(err["message"], "Invalid API token");
    }
}
