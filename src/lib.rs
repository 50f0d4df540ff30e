//! # Homework Tutor
//!
//! 作业拍照批改与逐题辅导服务
//!
//! ## 架构设计
//!
//! 本系统采用严格的分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺的共享资源，只暴露能力
//! - `Budget` - 请求级时间预算（单调时钟）
//! - `ProviderPools` - 识图 / 文本模型两个固定大小的调用池
//! - `KvStore` - 带 TTL 的键值存储（题库、会话、任务、幂等记录）
//! - `SessionLocks` - 每个会话一个写锁
//!
//! ### ② 客户端（Clients）
//! - `clients/` - 外部模型服务与图片下载
//!
//! ### ③ 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `VisionService` / `GradingService` - 识图与批改（含兜底链）
//! - `question_bank` / `wrong_items` - 题库重建与错题规范化
//! - `focus_router` / `corrections` / `relook` - 辅导会话的题号路由、更正与重新识图
//! - `IdempotencyGuard` / `SnapshotWriter` - 幂等与批改快照
//!
//! ### ④ 流程层（Workflow）
//! - `workflow/` - 定义"一次批改"与"一轮辅导"的完整流程
//! - `GradeFlow` - 识图 → 批改 → 建题库，由 `StageOutcome` 驱动
//! - `ChatFlow` - 会话状态机 + 流式推送
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/` - 装配共享资源、同步 / 异步调度
//!
//! ### ⑥ 接口层（API）
//! - `api/` - axum 路由
//!
//! ## 模块结构

pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use api::router;
pub use config::Config;
pub use error::{AppError, AppResult, ProviderError};
pub use orchestrator::{AppState, Backends};
pub use workflow::{ChatFlow, GradeCtx, GradeFlow, StageOutcome};
