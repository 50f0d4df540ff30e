//! 批改快照写入服务 - 业务能力层
//!
//! 只负责"追加一行 JSON"能力，不关心流程。写失败只记日志，不影响批改结果。

use crate::models::grade::{GradeMeta, GradeResponse, GradeStatus};
use crate::models::subject::Subject;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 单条快照（不含识图原文）
#[derive(Debug, Serialize)]
struct SnapshotLine<'a> {
    recorded_at: String,
    request_id: &'a str,
    session_id: &'a str,
    status: &'a GradeStatus,
    subject: &'a Subject,
    question_count: usize,
    wrong_item_ids: Vec<&'a str>,
    warnings: &'a [String],
    timings_ms: &'a BTreeMap<String, u64>,
    meta: &'a GradeMeta,
}

/// 快照写入服务
///
/// 职责：
/// - 每次批改结束后追加一行 JSON 到快照文件
/// - 同一进程内串行写入，保证行不交错
pub struct SnapshotWriter {
    path: String,
    lock: Mutex<()>,
}

impl SnapshotWriter {
    /// 使用自定义文件路径创建
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// 写入快照
    ///
    /// # 参数
    /// - `response`: 最终批改响应
    pub async fn record(&self, response: &GradeResponse) {
        if let Err(e) = self.append(response).await {
            warn!("⚠️ 写入批改快照失败 ({}): {}", self.path, e);
        }
    }

    async fn append(&self, response: &GradeResponse) -> std::io::Result<()> {
        let line = SnapshotLine {
            recorded_at: Utc::now().to_rfc3339(),
            request_id: &response.request_id,
            session_id: &response.session_id,
            status: &response.status,
            subject: &response.subject,
            question_count: response.questions.len(),
            wrong_item_ids: response.wrong_items.iter().map(|w| w.item_id.as_str()).collect(),
            warnings: &response.warnings,
            timings_ms: &response.timings_ms,
            meta: &response.meta,
        };
        let mut json = serde_json::to_string(&line)?;
        json.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;

        debug!(
            "写入批改快照: 请求 {} | 会话 {} | 错题 {}",
            response.request_id,
            response.session_id,
            response.wrong_items.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_response() {
        let path = std::env::temp_dir().join(format!("snapshots-{}.jsonl", uuid::Uuid::new_v4()));
        let writer = SnapshotWriter::with_path(path.to_string_lossy().to_string());

        let mut response = GradeResponse::new("r1", "s1", Subject::Math, GradeStatus::Done);
        response.vision_raw_text = "不应该出现在快照里".into();
        writer.record(&response).await;
        writer.record(&response).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["request_id"], "r1");
        assert!(!content.contains("不应该出现在快照里"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unwritable_path_is_only_logged() {
        let writer = SnapshotWriter::with_path("/nonexistent-dir/for/sure/snapshots.jsonl");
        let response = GradeResponse::new("r1", "s1", Subject::Math, GradeStatus::Failed);
        writer.record(&response).await;
    }
}
