//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责装配与调度，是整个服务的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app_state` - 应用状态
//! - 按配置创建共享资源（调用池、KV 存储、会话锁）
//! - 装配能力层与流程层
//! - 决定同步执行还是转入异步任务
//!
//! ### `job_queue` - 异步任务队列
//! - 任务记录的创建、推进与查询
//!
//! ## 层次关系
//!
//! ```text
//! api (HTTP 入口)
//!     ↓
//! orchestrator (AppState / JobQueue)
//!     ↓
//! workflow (GradeFlow / ChatFlow)
//!     ↓
//! services (能力层：识图 / 批改 / 题库 / 路由 …)
//!     ↓
//! clients + infrastructure (外部服务、池、存储、锁)
//! ```
//!
//! ## 设计原则
//!
//! 1. **资源集中**：只有编排层持有共享资源
//! 2. **向下依赖**：编排层 → workflow → services → infrastructure
//! 3. **无业务逻辑**：只做装配和调度，不做具体业务判断

pub mod app_state;
pub mod job_queue;

pub use app_state::{AppState, Backends};
pub use job_queue::JobQueue;
