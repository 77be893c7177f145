use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::api::AppState;
use crate::audit::{
    AuditEntry, AuditEntryRequest, ChainSummary, IntegrityStatus, Page, RequestOrigin, SearchFilter,
    VerificationResult,
};
use crate::error::AuditError;

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuditError::Validation(_) => StatusCode::BAD_REQUEST,
            AuditError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    #[serde(flatten)]
    pub entry: AuditEntry,
    pub replayed: bool,
}

pub async fn append_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<AuditEntryRequest>,
) -> Result<(StatusCode, Json<AppendResponse>), AuditError> {
    let deadline = Instant::now() + state.config.sequencer.append_timeout();
    let receipt = state
        .sequencer
        .append(request, origin_from_headers(&headers), Some(deadline))
        .await?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(AppendResponse {
            entry: receipt.entry,
            replayed: receipt.replayed,
        }),
    ))
}

pub async fn get_entry(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<AuditEntry>, AuditError> {
    Ok(Json(state.query.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    pub trace_id: Option<String>,
}

pub async fn entries_by_trace(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<TraceQuery>,
) -> Result<Json<Vec<AuditEntry>>, AuditError> {
    let trace_id = query
        .trace_id
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AuditError::validation("trace_id", "query parameter is required"))?;
    Ok(Json(state.query.by_trace(&trace_id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    #[serde(flatten)]
    pub filter: SearchFilter,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub async fn search_entries(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SearchRequest>,
) -> Result<Json<Page<AuditEntry>>, AuditError> {
    let page = state.query.page_request(request.page, request.page_size);
    Ok(Json(state.query.search(&request.filter, page).await?))
}

pub async fn chain_summary(State(state): State<AppState>) -> Result<Json<ChainSummary>, AuditError> {
    Ok(Json(state.query.chain_summary().await?))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub start_id: Option<Uuid>,
    pub limit: Option<u64>,
}

pub async fn verify_chain(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<VerifyQuery>,
) -> Result<Json<VerificationResult>, AuditError> {
    let result = state.verifier.verify_range(query.start_id, query.limit).await?;

    if query.start_id.is_none() && query.limit.is_none() {
        state.integrity.record(result.clone()).await;
    }
    if result.valid {
        info!("On-demand verification passed: {}", result.summary());
    } else {
        warn!("On-demand verification failed: {}", result.summary());
    }
    Ok(Json(result))
}

/// Store liveness plus the last integrity verdict, without re-verifying.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let integrity = state.integrity.cached().await.map(|result| {
        if result.valid {
            IntegrityStatus::Valid
        } else {
            IntegrityStatus::Broken
        }
    });

    match state.database.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": "compliance-audit",
                "integrity_status": integrity,
                "timestamp": chrono::Utc::now()
            })),
        ),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "service": "compliance-audit",
                    "error": e.to_string(),
                    "timestamp": chrono::Utc::now()
                })),
            )
        }
    }
}

/// Client address from the first `X-Forwarded-For` hop, else `X-Real-IP`.
pub fn origin_from_headers(headers: &HeaderMap) -> RequestOrigin {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let source_ip = header("x-forwarded-for")
        .and_then(|list| list.split(',').next().map(|hop| hop.trim().to_string()))
        .filter(|hop| !hop.is_empty())
        .or_else(|| header("x-real-ip"));

    RequestOrigin {
        source_ip,
        user_agent: header("user-agent"),
    }
}
