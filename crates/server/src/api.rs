//! HTTP surface for a messaging transport and for operators.
//!
//! Endpoints:
//! - `GET  /health`                      - database and admission readiness
//! - `POST /messages`                    - run one inbound message through the assistant
//! - `GET  /senders/{sender}/outbox`     - collect replies produced by the flush timer
//! - `POST /senders/{sender}/unblock`    - lift a sender's block
//! - `POST /senders/{sender}/reset`      - zero a sender's daily response counter
//! - `GET  /admission/status`            - budget, cache, coalescing and throttle snapshot
//! - `GET  /admission/persisted`         - per-namespace record counts in the state table
//! - `POST /admission/reactivate`        - resume model calls after a budget shutdown
//! - `POST /admission/deactivate`        - suspend model calls
//! - `POST /admission/maintenance`       - run the cache/coalescing/throttle sweep now

use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prechat_agent::{AssistantReply, AssistantRuntime};
use prechat_core::domain::SenderId;
use prechat_core::errors::{ApplicationError, DomainError, InterfaceError};
use prechat_core::{AdmissionSnapshot, MaintenanceReport};
use prechat_db::{DbPool, NamespaceSummary, SqlStateStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::health::{health, HealthState};
use crate::outbox::Outbox;

const MAX_MESSAGE_CHARS: usize = 4_000;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<AssistantRuntime>,
    pub outbox: Arc<Outbox>,
    pub db_pool: DbPool,
}

impl FromRef<ApiState> for HealthState {
    fn from_ref(state: &ApiState) -> Self {
        HealthState {
            db_pool: state.db_pool.clone(),
            coordinator: Arc::clone(state.runtime.coordinator()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
    pub menu_choice: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub correlation_id: String,
    pub reply: AssistantReply,
    /// Earlier replies for this sender that the flush timer produced in the meantime.
    pub pending: Vec<AssistantReply>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct OperatorResponse {
    pub action: &'static str,
    pub changed: bool,
    pub system_active: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SenderActionResponse {
    pub action: &'static str,
    pub sender: String,
    pub changed: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PersistedNamespace {
    pub namespace: String,
    pub records: i64,
    pub last_updated_at: Option<String>,
}

impl From<NamespaceSummary> for PersistedNamespace {
    fn from(summary: NamespaceSummary) -> Self {
        Self {
            namespace: summary.namespace,
            records: summary.records,
            last_updated_at: summary.last_updated_at.map(|at| at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub detail: Option<String>,
    pub correlation_id: String,
}

/// `InterfaceError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl From<InterfaceError> for ApiError {
    fn from(value: InterfaceError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            InterfaceError::BadRequest { message, .. } => {
                (StatusCode::BAD_REQUEST, Some(message.clone()))
            }
            InterfaceError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, None),
        };
        let body = ErrorBody {
            error: self.0.user_message(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/messages", post(post_message))
        .route("/senders/{sender}/outbox", get(get_outbox))
        .route("/senders/{sender}/unblock", post(unblock_sender))
        .route("/senders/{sender}/reset", post(reset_sender))
        .route("/admission/status", get(admission_status))
        .route("/admission/persisted", get(persisted_state))
        .route("/admission/reactivate", post(reactivate))
        .route("/admission/deactivate", post(deactivate))
        .route("/admission/maintenance", post(run_maintenance))
        .with_state(state)
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn parse_sender(raw: &str, correlation_id: &str) -> Result<SenderId, ApiError> {
    SenderId::parse(raw)
        .map_err(|error| ApiError(ApplicationError::from(error).into_interface(correlation_id)))
}

pub async fn post_message(
    State(state): State<ApiState>,
    Json(request): Json<InboundMessage>,
) -> Result<Json<MessageResponse>, ApiError> {
    let correlation_id = correlation_id();
    let sender = parse_sender(&request.sender, &correlation_id)?;

    let text = request.text.trim();
    if text.is_empty() || text.chars().count() > MAX_MESSAGE_CHARS {
        let error = DomainError::InvariantViolation(format!(
            "message text must contain between 1 and {MAX_MESSAGE_CHARS} characters"
        ));
        return Err(ApiError(ApplicationError::from(error).into_interface(correlation_id)));
    }

    let reply = state.runtime.handle_message(&sender, text, request.menu_choice.as_deref()).await;
    let pending = state.outbox.drain(sender.as_str()).await;

    info!(
        event_name = "server.api.message_handled",
        correlation_id = %correlation_id,
        sender = %sender,
        decision = reply.decision,
        intent = reply.intent.as_str(),
        pending = pending.len(),
        "inbound message handled"
    );

    Ok(Json(MessageResponse { correlation_id, reply, pending }))
}

pub async fn get_outbox(
    State(state): State<ApiState>,
    Path(sender): Path<String>,
) -> Result<Json<Vec<AssistantReply>>, ApiError> {
    let sender = parse_sender(&sender, &correlation_id())?;
    Ok(Json(state.outbox.drain(sender.as_str()).await))
}

pub async fn unblock_sender(
    State(state): State<ApiState>,
    Path(sender): Path<String>,
) -> Result<Json<SenderActionResponse>, ApiError> {
    let correlation_id = correlation_id();
    let sender = parse_sender(&sender, &correlation_id)?;
    let changed = state.runtime.coordinator().unblock(&sender).await;
    info!(
        event_name = "server.operator.unblock",
        correlation_id = %correlation_id,
        sender = %sender,
        changed,
        "operator unblock"
    );
    Ok(Json(SenderActionResponse { action: "unblock", sender: sender.to_string(), changed }))
}

pub async fn reset_sender(
    State(state): State<ApiState>,
    Path(sender): Path<String>,
) -> Result<Json<SenderActionResponse>, ApiError> {
    let correlation_id = correlation_id();
    let sender = parse_sender(&sender, &correlation_id)?;
    let changed = state.runtime.coordinator().reset_counter(&sender).await;
    info!(
        event_name = "server.operator.reset_counter",
        correlation_id = %correlation_id,
        sender = %sender,
        changed,
        "operator counter reset"
    );
    Ok(Json(SenderActionResponse { action: "reset", sender: sender.to_string(), changed }))
}

pub async fn admission_status(State(state): State<ApiState>) -> Json<AdmissionSnapshot> {
    Json(state.runtime.coordinator().snapshot().await)
}

pub async fn persisted_state(
    State(state): State<ApiState>,
) -> Result<Json<Vec<PersistedNamespace>>, ApiError> {
    let correlation_id = correlation_id();
    let summaries = SqlStateStore::new(state.db_pool.clone()).summarize().await.map_err(|error| {
        warn!(
            event_name = "server.api.persisted_state_failed",
            correlation_id = %correlation_id,
            error = %error,
            "persisted admission state could not be read"
        );
        ApiError(ApplicationError::Persistence(error.to_string()).into_interface(correlation_id.clone()))
    })?;
    Ok(Json(summaries.into_iter().map(PersistedNamespace::from).collect()))
}

pub async fn reactivate(State(state): State<ApiState>) -> Json<OperatorResponse> {
    let coordinator = state.runtime.coordinator();
    let changed = coordinator.reactivate().await;
    info!(event_name = "server.operator.reactivate", changed, "operator reactivation");
    Json(OperatorResponse {
        action: "reactivate",
        changed,
        system_active: coordinator.budget().is_active().await,
    })
}

pub async fn deactivate(State(state): State<ApiState>) -> Json<OperatorResponse> {
    let coordinator = state.runtime.coordinator();
    let was_active = coordinator.budget().is_active().await;
    coordinator.deactivate().await;
    warn!(event_name = "server.operator.deactivate", was_active, "operator suspended model calls");
    Json(OperatorResponse {
        action: "deactivate",
        changed: was_active,
        system_active: coordinator.budget().is_active().await,
    })
}

pub async fn run_maintenance(State(state): State<ApiState>) -> Json<MaintenanceReport> {
    Json(state.runtime.coordinator().run_maintenance().await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::{Path, State};
    use axum::http::{Request, StatusCode};
    use axum::Json;
    use prechat_agent::{
        AssistantRuntime, ChatMessage, ModelInvoker, ModelOutcome, ModelParams,
    };
    use prechat_core::config::AppConfig;
    use prechat_core::{AdmissionCoordinator, CharRatioEstimator, InMemoryStateStore, SystemClock};
    use prechat_db::{connect_with_settings, migrations};
    use tower::ServiceExt;

    use super::{
        admission_status, deactivate, persisted_state, post_message, reactivate, router,
        unblock_sender, ApiState, InboundMessage,
    };
    use crate::outbox::Outbox;

    struct EchoModel;

    #[async_trait]
    impl ModelInvoker for EchoModel {
        async fn invoke(&self, messages: &[ChatMessage], _params: &ModelParams) -> ModelOutcome {
            let last = messages.last().map(|message| message.content.clone()).unwrap_or_default();
            ModelOutcome::Success { text: format!("echo: {last}"), total_tokens: Some(25) }
        }
    }

    async fn state() -> ApiState {
        let mut config = AppConfig::default();
        config.coalescing.enabled = false;
        let estimator = Arc::new(CharRatioEstimator::default());
        let coordinator = Arc::new(
            AdmissionCoordinator::restore(
                &config,
                Arc::new(SystemClock),
                Arc::new(InMemoryStateStore::new()),
                estimator.clone(),
            )
            .await,
        );
        let runtime = AssistantRuntime::new(
            coordinator,
            Arc::new(EchoModel),
            estimator,
            ModelParams::from_config(&config.llm),
        );
        ApiState {
            runtime: Arc::new(runtime),
            outbox: Arc::new(Outbox::new(8)),
            db_pool: connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool"),
        }
    }

    fn inbound(sender: &str, text: &str) -> Json<InboundMessage> {
        Json(InboundMessage { sender: sender.to_string(), text: text.to_string(), menu_choice: None })
    }

    #[tokio::test]
    async fn message_is_answered_by_the_model_and_counted() {
        let state = state().await;

        let Json(response) =
            post_message(State(state.clone()), inbound("5511977776666", "Como funciona?"))
                .await
                .expect("handled");

        assert_eq!(response.reply.decision, "proceed_to_model");
        assert!(response.reply.text.starts_with("echo: "));
        assert!(response.pending.is_empty());

        let Json(snapshot) = admission_status(State(state)).await;
        assert_eq!(snapshot.throttle.responses_today, 1);
        assert_eq!(snapshot.budget.requests_per_minute.used, 1);
    }

    #[tokio::test]
    async fn blank_text_is_rejected_with_correlation_id() {
        let state = state().await;
        let error = post_message(State(state), inbound("5511977776666", "   "))
            .await
            .expect_err("blank text should fail");

        assert!(!error.0.correlation_id().is_empty());
        assert_eq!(error.0.user_message(), "The message could not be processed. Check inputs and try again.");
    }

    #[tokio::test]
    async fn operator_toggles_the_budget() {
        let state = state().await;

        let Json(off) = deactivate(State(state.clone())).await;
        assert!(off.changed);
        assert!(!off.system_active);

        let Json(reply) = post_message(State(state.clone()), inbound("5511977776666", "oi"))
            .await
            .expect("handled");
        assert_eq!(reply.reply.decision, "budget_exceeded");

        let Json(on) = reactivate(State(state)).await;
        assert!(on.changed);
        assert!(on.system_active);
    }

    #[tokio::test]
    async fn unblock_releases_a_buyer() {
        let state = state().await;
        let Json(first) = post_message(State(state.clone()), inbound("5511977776666", "quero comprar"))
            .await
            .expect("handled");
        assert!(first.reply.handoff.is_some());

        let Json(unblocked) =
            unblock_sender(State(state.clone()), Path("5511977776666".to_string())).await.expect("unblock");
        assert!(unblocked.changed);

        let Json(next) = post_message(State(state), inbound("5511977776666", "oi de novo"))
            .await
            .expect("handled");
        assert_ne!(next.reply.decision, "blocked");
    }

    #[tokio::test]
    async fn router_maps_invalid_sender_to_bad_request() {
        let app = router(state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/messages")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sender":"   ","text":"oi"}"#))
            .expect("request");

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn persisted_state_lists_namespaces_written_by_the_store() {
        let state = state().await;
        migrations::run_pending(&state.db_pool).await.expect("migrations");
        sqlx::query(
            "INSERT INTO admission_state (namespace, state_key, payload_json, updated_at)
             VALUES ('user_state', '5511977776666', '{}', '2026-06-01T11:00:00Z')",
        )
        .execute(&state.db_pool)
        .await
        .expect("insert");

        let Json(namespaces) = persisted_state(State(state)).await.expect("summary");
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].namespace, "user_state");
        assert_eq!(namespaces[0].records, 1);
    }

    #[tokio::test]
    async fn unreadable_state_table_maps_to_service_unavailable() {
        let state = state().await;
        state.db_pool.close().await;

        let app = router(state);
        let request =
            Request::builder().uri("/admission/persisted").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn router_serves_health() {
        let app = router(state().await);
        let request = Request::builder().uri("/health").body(Body::empty()).expect("request");

        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
