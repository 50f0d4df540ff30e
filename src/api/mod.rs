//! HTTP 接口层
//!
//! 只做请求解析、校验与响应编码，流程一律交给编排层。

pub mod chat;
pub mod error;
pub mod grade;
pub mod session;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::orchestrator::AppState;

pub use error::ApiError;
pub use grade::{FORCE_ASYNC_HEADER, IDEMPOTENCY_KEY_HEADER};

/// 构建路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/grade", post(grade::grade))
        .route("/jobs/{id}", get(grade::job_status))
        .route("/chat", post(chat::chat))
        .route("/session/{id}/qbank", get(session::qbank))
        .route("/healthz", get(session::healthz))
        .with_state(state)
}
