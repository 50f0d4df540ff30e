//! 应用状态 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：按配置创建共享资源（调用池、KV 存储、会话锁）
//! 2. **依赖装配**：把客户端注入能力层，再把能力层注入流程层
//! 3. **请求调度**：同步批改直接执行；大请求转入异步任务；辅导对话在独立任务中推送
//!
//! 唯一持有所有共享资源的地方，HTTP 层只通过它发起流程。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::clients::{
    HttpImageFetcher, ImageFetcher, ImageProxy, LlmBackend, OpenAiBackend, VisionBackend,
};
use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::{Budget, KvStore, MemoryKvStore, ProviderPools, SessionLocks};
use crate::models::grade::{GradeRequest, GradeResponse};
use crate::models::job::JobRecord;
use crate::models::session::{ChatEvent, ChatRequest};
use crate::orchestrator::job_queue::JobQueue;
use crate::services::{GradingService, IdempotencyGuard, SessionStore, SnapshotWriter, VisionService};
use crate::workflow::{ChatFlow, GradeCtx, GradeFlow};

/// 推送通道容量
const CHAT_CHANNEL_CAPACITY: usize = 32;

/// 外部协作方
pub struct Backends {
    pub vision: Arc<dyn VisionBackend>,
    pub llm: Arc<dyn LlmBackend>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub proxy: Option<Arc<dyn ImageProxy>>,
}

impl Backends {
    /// 生产实现：OpenAI 兼容接口 + reqwest 下载，不配置代理转存
    pub fn from_config(config: &Config) -> Self {
        let backend = Arc::new(OpenAiBackend::new(config));
        Self {
            vision: backend.clone(),
            llm: backend,
            fetcher: Arc::new(HttpImageFetcher::new()),
            proxy: None,
        }
    }
}

/// 应用状态
pub struct AppState {
    pub config: Config,
    pub grade_flow: Arc<GradeFlow>,
    pub chat_flow: Arc<ChatFlow>,
    pub idempotency: IdempotencyGuard,
    pub jobs: JobQueue,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    /// 装配应用
    ///
    /// # 参数
    /// - `config`: 配置
    /// - `backends`: 外部协作方（测试时注入假实现）
    /// - `store`: KV 存储
    pub fn new(config: Config, backends: Backends, store: Arc<dyn KvStore>) -> Self {
        let pools = ProviderPools::new(config.vision_pool_size, config.llm_pool_size);
        let locks = Arc::new(SessionLocks::new());
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            Duration::from_secs(config.session_ttl_secs),
        ));

        let vision = Arc::new(VisionService::new(
            backends.vision,
            backends.fetcher,
            backends.proxy,
            pools.clone(),
        ));
        let grading = Arc::new(GradingService::new(
            backends.llm.clone(),
            pools.clone(),
            config.grading_fallback,
            config.grading_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
        ));

        let grade_flow = Arc::new(GradeFlow::new(
            vision.clone(),
            grading,
            sessions.clone(),
            locks.clone(),
            Arc::new(SnapshotWriter::with_path(config.snapshot_file.clone())),
            config.vision_timeout(),
            config.grading_timeout(),
        ));
        let chat_flow = Arc::new(ChatFlow::new(
            backends.llm,
            vision,
            sessions.clone(),
            locks,
            config.tutor_provider,
            config.relook_timeout(),
            config.chat_throttle(),
            config.heartbeat_interval(),
        ));

        Self {
            idempotency: IdempotencyGuard::new(
                store.clone(),
                Duration::from_secs(config.idempotency_ttl_secs),
            ),
            jobs: JobQueue::new(store, Duration::from_secs(config.job_ttl_secs)),
            grade_flow,
            chat_flow,
            sessions,
            config,
        }
    }

    /// 使用生产实现与进程内存储装配，同时返回存储以便定期清理
    pub fn from_config(config: Config) -> (Self, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let backends = Backends::from_config(&config);
        (Self::new(config, backends, store.clone()), store)
    }

    /// 是否转为异步任务
    pub fn should_run_async(&self, request: &GradeRequest, force_async: bool) -> bool {
        force_async || request.images.len() > self.config.max_sync_images
    }

    /// 为请求创建上下文；未带会话ID时生成一个
    pub fn new_ctx(&self, request: &GradeRequest) -> GradeCtx {
        let session_id = request
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        GradeCtx::new(
            Uuid::new_v4().to_string(),
            session_id,
            request.subject,
            Budget::start(self.config.grade_sla()),
        )
    }

    /// 同步批改
    pub async fn grade(&self, request: &GradeRequest) -> GradeResponse {
        let ctx = self.new_ctx(request);
        self.grade_flow.run(request, &ctx).await
    }

    /// 提交异步批改任务，立即返回排队中的任务记录
    ///
    /// 时间预算从任务开始执行时计算。
    pub async fn submit_job(&self, request: GradeRequest) -> AppResult<JobRecord> {
        let ctx = self.new_ctx(&request);
        let job = self.jobs.create(&ctx.session_id).await?;

        let jobs = self.jobs.clone();
        let flow = self.grade_flow.clone();
        let sla = self.config.grade_sla();
        let mut running = job.clone();
        tokio::spawn(async move {
            if let Err(e) = jobs.mark_running(&mut running).await {
                jobs.fail(&mut running, e.to_string()).await;
                return;
            }
            info!("⚙️ 任务 {} 开始执行", running.job_id);
            let ctx = GradeCtx {
                budget: Budget::start(sla),
                ..ctx
            };
            let response = flow.run(&request, &ctx).await;
            if let Err(e) = jobs.complete(&mut running, response).await {
                error!("❌ 任务 {} 结果写入失败: {}", running.job_id, e);
                jobs.fail(&mut running, e.to_string()).await;
            }
        });

        Ok(job)
    }

    /// 开始一轮辅导对话，返回事件接收端；接收端被丢弃时对话提前结束
    pub fn chat(&self, request: ChatRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(CHAT_CHANNEL_CAPACITY);
        let flow = self.chat_flow.clone();
        tokio::spawn(async move {
            flow.run(request, tx).await;
        });
        rx
    }
}
