//! 异步批改任务队列 - 编排层
//!
//! 任务记录存放在 KV 存储里（`job:<id>`），由轮询读取，不主动推送。
//! 状态只会向前推进：queued → running → done | failed。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppResult;
use crate::infrastructure::{get_json, set_json, KvStore};
use crate::models::grade::{GradeResponse, GradeStatus};
use crate::models::job::{JobRecord, JobStatus};

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(job_id: &str) -> String {
        format!("job:{}", job_id)
    }

    /// 创建排队中的任务
    pub async fn create(&self, session_id: &str) -> AppResult<JobRecord> {
        let job = JobRecord::queued(Uuid::new_v4().to_string(), session_id);
        self.save(&job).await?;
        info!("📥 任务 {} 已排队 (会话 {})", job.job_id, session_id);
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        get_json(self.store.as_ref(), &Self::key(job_id)).await
    }

    pub async fn mark_running(&self, job: &mut JobRecord) -> AppResult<()> {
        job.status = JobStatus::Running;
        self.save(job).await
    }

    /// 写入最终结果：批改状态为 failed 时任务也记为 failed，响应照样附上
    pub async fn complete(&self, job: &mut JobRecord, response: GradeResponse) -> AppResult<()> {
        if response.status == GradeStatus::Failed {
            job.status = JobStatus::Failed;
            job.error = Some(
                response
                    .warnings
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "grading failed".to_string()),
            );
        } else {
            job.status = JobStatus::Done;
        }
        job.result = Some(response);
        self.save(job).await
    }

    /// 任务执行过程中出现意外错误
    pub async fn fail(&self, job: &mut JobRecord, message: String) {
        job.status = JobStatus::Failed;
        job.error = Some(message);
        if let Err(e) = self.save(job).await {
            error!("❌ 任务 {} 状态写入失败: {}", job.job_id, e);
        }
    }

    async fn save(&self, job: &JobRecord) -> AppResult<()> {
        let mut job = job.clone();
        job.updated_at = Utc::now();
        set_json(self.store.as_ref(), &Self::key(&job.job_id), &job, self.ttl).await
    }
}
