//! 批改接口
//!
//! - `POST /grade`：同步返回 200 + 批改响应；大请求或带强制异步标记时返回 202 + 任务ID
//! - `GET /jobs/{id}`：轮询异步任务

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::error::AppError;
use crate::models::grade::{GradeRequest, GradeResponse, GradeStatus};
use crate::models::job::JobRecord;
use crate::orchestrator::AppState;
use crate::services::idempotency::fingerprint;
use crate::services::validation::validate_grade_request;
use crate::services::IdempotencyCheck;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const FORCE_ASYNC_HEADER: &str = "x-force-async";

/// 202 响应：占位批改响应 + 任务ID
#[derive(Debug, Serialize)]
struct Accepted {
    job_id: String,
    #[serde(flatten)]
    response: GradeResponse,
}

pub async fn grade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: GradeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed grade request: {}", e)))?;
    validate_grade_request(&request)?;

    let force_async = header_flag(&headers, FORCE_ASYNC_HEADER);
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let request_fingerprint = fingerprint(&request, force_async);

    if let Some(key) = &idempotency_key {
        match state.idempotency.check(key, &request_fingerprint).await? {
            IdempotencyCheck::Fresh => {}
            IdempotencyCheck::Replay(record) => {
                info!("↩️ 幂等重放: {}", key);
                let status = StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);
                return Ok(json_response(status, record.response));
            }
            IdempotencyCheck::Conflict => {
                return Err(AppError::IdempotencyConflict { key: key.clone() }.into());
            }
        }
    }

    let (status, body) = if state.should_run_async(&request, force_async) {
        let job = state.submit_job(request.clone()).await?;
        let accepted = Accepted {
            response: GradeResponse::new(
                &job.job_id,
                &job.session_id,
                request.subject,
                GradeStatus::Processing,
            ),
            job_id: job.job_id,
        };
        (StatusCode::ACCEPTED, to_json(&accepted)?)
    } else {
        let response = state.grade(&request).await;
        (StatusCode::OK, to_json(&response)?)
    };

    if let Some(key) = &idempotency_key {
        if let Err(e) = state
            .idempotency
            .store(key, &request_fingerprint, status.as_u16(), body.clone())
            .await
        {
            warn!("⚠️ 幂等记录写入失败 ({}): {}", key, e);
        }
    }

    Ok(json_response(status, body))
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .jobs
        .get(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))
}

// ========== 辅助函数 ==========

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|e| ApiError::Internal(e.to_string()))
}

/// 直接返回已序列化的正文，保证重放时字节一致
fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
