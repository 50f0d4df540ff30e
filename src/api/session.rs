//! 会话调试接口
//!
//! `GET /session/{id}/qbank` 只返回题库规模、选项覆盖与耗时，不返回识图原文。

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::models::question::{AnswerStatus, QuestionBank, Verdict};
use crate::orchestrator::AppState;

#[derive(Debug, Serialize)]
pub struct QuestionSummary {
    pub question_number: String,
    pub verdict: Verdict,
    pub answer_status: AnswerStatus,
    pub option_count: usize,
    pub content_chars: usize,
    pub warning_count: usize,
}

#[derive(Debug, Serialize)]
pub struct BankSummary {
    pub session_id: String,
    pub source: &'static str,
    pub vision_provider: String,
    pub size: usize,
    pub questions_with_options: usize,
    pub questions: Vec<QuestionSummary>,
    pub timings_ms: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

impl From<&QuestionBank> for BankSummary {
    fn from(bank: &QuestionBank) -> Self {
        let questions: Vec<QuestionSummary> = bank
            .questions
            .iter()
            .map(|q| QuestionSummary {
                question_number: q.question_number.clone(),
                verdict: q.verdict,
                answer_status: q.answer_status,
                option_count: q.options.len(),
                content_chars: q.content.chars().count(),
                warning_count: q.warnings.len(),
            })
            .collect();

        Self {
            session_id: bank.session_id.clone(),
            source: bank.source.as_str(),
            vision_provider: bank.vision_provider.to_string(),
            size: bank.len(),
            questions_with_options: questions.iter().filter(|q| q.option_count > 0).count(),
            questions,
            timings_ms: bank.timings_ms.clone(),
            updated_at: bank.updated_at,
        }
    }
}

pub async fn qbank(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<BankSummary>, ApiError> {
    let bank = state
        .sessions
        .load_bank(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("question bank for session {}", session_id)))?;
    Ok(Json(BankSummary::from(&bank)))
}

pub async fn healthz() -> &'static str {
    "ok"
}
