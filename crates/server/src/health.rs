use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use prechat_core::AdmissionCoordinator;
use prechat_db::DbPool;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    /// The model budget being switched off is reported, not treated as unhealthy.
    pub admission: HealthCheck,
    pub checked_at: String,
}

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub coordinator: Arc<AdmissionCoordinator>,
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let budget = state.coordinator.budget().status().await;
    let admission = if budget.system_active {
        HealthCheck { status: "ready", detail: "model calls admitted".to_string() }
    } else {
        HealthCheck {
            status: "deactivated",
            detail: match budget.deactivation_reason {
                Some(reason) => format!("model calls suspended: {}", reason.describe()),
                None => "model calls suspended".to_string(),
            },
        }
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "prechat-server runtime initialized".to_string(),
        },
        database,
        admission,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
