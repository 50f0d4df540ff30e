//! 辅导接口
//!
//! `POST /chat` 以 SSE 推送 `heartbeat` / `chat` / `done` / `error` 事件。

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::error::ApiError;
use crate::models::session::{ChatEvent, ChatRequest};
use crate::orchestrator::AppState;

pub async fn chat(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, ApiError> {
    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed chat request: {}", e)))?;
    if request.session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session_id is required".to_string()));
    }
    if request.question.trim().is_empty() {
        return Err(ApiError::BadRequest("question is required".to_string()));
    }

    let events = ReceiverStream::new(state.chat(request)).map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn to_sse(event: &ChatEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"event":"error","message":"serialization failed"}"#.to_string());
    Event::default().event(event.name()).data(payload)
}
