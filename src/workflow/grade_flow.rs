//! 批改流程 - 流程层
//!
//! 核心职责：定义"一次批改请求"的完整处理流程
//!
//! 流程顺序：
//! 1. 识图（含兜底链）
//! 2. 批改（主服务商 → 备用服务商）
//! 3. 建题库（批改结果 + 原文重建合并）
//! 4. 落库 + 写快照
//!
//! 任何阶段失败都先留下一个可用于聊天的题库，再返回响应。
//! 图片里没有作业时不进入批改，状态为 `rejected`。

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::infrastructure::{SessionLocks, StageTimer};
use crate::models::grade::{GradeRequest, GradeResponse, GradeStatus};
use crate::models::provider::LlmProvider;
use crate::models::question::{QuestionBank, QuestionRecord, Verdict, WrongItem};
use crate::services::grading_service::GraderOutput;
use crate::services::question_bank::{build_bank, NOT_GRADED};
use crate::services::vision_service::AttemptKind;
use crate::services::{
    prompts, wrong_items, GradingOutput, GradingService, SessionStore, SnapshotWriter,
    VisionOutput, VisionService,
};
use crate::workflow::grade_ctx::GradeCtx;
use crate::workflow::stage_outcome::StageOutcome;

/// 批改流程
///
/// - 编排识图 → 批改 → 建题库
/// - 决定何时降级、何时直接返回
/// - 不直接调用外部服务，只依赖业务能力（services）
pub struct GradeFlow {
    vision: Arc<VisionService>,
    grading: Arc<GradingService>,
    sessions: Arc<SessionStore>,
    locks: Arc<SessionLocks>,
    snapshots: Arc<SnapshotWriter>,
    vision_timeout: Duration,
    grading_timeout: Duration,
}

impl GradeFlow {
    pub fn new(
        vision: Arc<VisionService>,
        grading: Arc<GradingService>,
        sessions: Arc<SessionStore>,
        locks: Arc<SessionLocks>,
        snapshots: Arc<SnapshotWriter>,
        vision_timeout: Duration,
        grading_timeout: Duration,
    ) -> Self {
        Self {
            vision,
            grading,
            sessions,
            locks,
            snapshots,
            vision_timeout,
            grading_timeout,
        }
    }

    /// 执行一次批改
    ///
    /// # 参数
    /// - `request`: 已校验的批改请求
    /// - `ctx`: 批改上下文（预算已开始计时）
    ///
    /// # 返回
    /// 最终响应；失败也以响应形式返回，原因写在 `warnings` 里
    pub async fn run(&self, request: &GradeRequest, ctx: &GradeCtx) -> GradeResponse {
        let total = StageTimer::start();
        let mut response = GradeResponse::new(
            &ctx.request_id,
            &ctx.session_id,
            ctx.subject,
            GradeStatus::Processing,
        );
        response.meta.vision_provider_requested = request.vision_provider.to_string();

        info!(
            "{} 🚀 开始批改: {} 张图, 识图 {}",
            ctx,
            request.images.len(),
            request.vision_provider
        );

        // ========== 阶段 1: 识图 ==========
        let vision = match self.vision_stage(request, ctx, &mut response, &total).await {
            StageOutcome::Success(vision) => vision,
            StageOutcome::Recoverable(reason) => {
                warn!("{} 🚫 {}", ctx, reason);
                response.warnings.push(reason);
                return self
                    .finish(request, ctx, response, "", None, GradeStatus::Rejected, &total)
                    .await;
            }
            StageOutcome::Fatal(response) => return *response,
        };
        response.vision_raw_text = vision.text.clone();

        // ========== 阶段 2: 批改 ==========
        let primary = request.llm_provider.unwrap_or_default();
        let graded = match self.grading_stage(request, ctx, &vision, primary, &mut response, &total).await {
            StageOutcome::Success(output) => Some(output.graded),
            StageOutcome::Recoverable(reason) => {
                warn!("{} ⚠️ 批改失败，仅用原文建题库: {}", ctx, reason);
                None
            }
            StageOutcome::Fatal(response) => return *response,
        };

        // ========== 阶段 3: 建题库 ==========
        let status = if graded.is_some() {
            GradeStatus::Done
        } else {
            GradeStatus::Failed
        };
        self.finish(request, ctx, response, &vision.text, graded, status, &total)
            .await
    }

    // ========== 阶段 ==========

    async fn vision_stage(
        &self,
        request: &GradeRequest,
        ctx: &GradeCtx,
        response: &mut GradeResponse,
        total: &StageTimer,
    ) -> StageOutcome<VisionOutput> {
        let timer = StageTimer::start();
        let prompt = prompts::vision_prompt(ctx.subject);
        let result = self
            .vision
            .analyze(
                request.vision_provider,
                &request.images,
                &prompt,
                &ctx.budget,
                self.vision_timeout,
            )
            .await;
        response
            .timings_ms
            .insert("vision_ms".to_string(), timer.elapsed_ms());

        match result {
            Ok(output) => {
                info!(
                    "{} ✓ 识图完成 ({}，{} 字)",
                    ctx,
                    output.attempt_used.label(),
                    output.text.chars().count()
                );
                response.warnings.extend(output.warnings.iter().cloned());
                response.meta.vision_provider_used = Some(output.provider_used.to_string());
                response.meta.vision_used_proxy_url = output.attempt_used == AttemptKind::ProxyUrl;
                response.meta.vision_used_base64_fallback =
                    output.attempt_used == AttemptKind::InlineBase64;
                if output.text.contains(prompts::NO_HOMEWORK_MARKER) {
                    return StageOutcome::Recoverable(
                        "vision found no homework questions in the images".to_string(),
                    );
                }
                StageOutcome::Success(output)
            }
            Err(failure) => {
                error!(
                    "{} ❌ 识图失败{}",
                    ctx,
                    if failure.budget_exhausted { "（预算耗尽）" } else { "" }
                );
                response.warnings.extend(failure.warnings);
                let partial = std::mem::replace(
                    response,
                    GradeResponse::new(&ctx.request_id, &ctx.session_id, ctx.subject, GradeStatus::Failed),
                );
                let finished = self
                    .finish(request, ctx, partial, "", None, GradeStatus::Failed, total)
                    .await;
                StageOutcome::Fatal(Box::new(finished))
            }
        }
    }

    async fn grading_stage(
        &self,
        request: &GradeRequest,
        ctx: &GradeCtx,
        vision: &VisionOutput,
        primary: LlmProvider,
        response: &mut GradeResponse,
        total: &StageTimer,
    ) -> StageOutcome<GradingOutput> {
        let timer = StageTimer::start();
        let result = self
            .grading
            .grade(
                ctx.subject,
                &vision.text,
                primary,
                &ctx.budget,
                self.grading_timeout,
            )
            .await;
        response
            .timings_ms
            .insert("grading_ms".to_string(), timer.elapsed_ms());

        match result {
            Ok(output) => {
                info!(
                    "{} ✓ 批改完成 ({}，{} 题)",
                    ctx,
                    output.provider_used,
                    output.graded.questions.len()
                );
                response.warnings.extend(output.warnings.iter().cloned());
                response.meta.llm_provider_used = Some(output.provider_used.to_string());
                response.meta.grading_fallback_used = output.fallback_used;
                StageOutcome::Success(output)
            }
            Err(failure) if failure.budget_exhausted => {
                error!("{} ❌ 批改阶段预算耗尽", ctx);
                response.warnings.extend(failure.warnings);
                let partial = std::mem::replace(
                    response,
                    GradeResponse::new(&ctx.request_id, &ctx.session_id, ctx.subject, GradeStatus::Failed),
                );
                let finished = self
                    .finish(request, ctx, partial, &vision.text, None, GradeStatus::Failed, total)
                    .await;
                StageOutcome::Fatal(Box::new(finished))
            }
            Err(failure) => {
                let reason = failure
                    .last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no grading provider succeeded".to_string());
                response.warnings.extend(failure.warnings);
                StageOutcome::Recoverable(reason)
            }
        }
    }

    /// 建题库、算错题、落库、写快照
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        request: &GradeRequest,
        ctx: &GradeCtx,
        mut response: GradeResponse,
        raw_text: &str,
        graded: Option<GraderOutput>,
        status: GradeStatus,
        total: &StageTimer,
    ) -> GradeResponse {
        let timer = StageTimer::start();
        let graded = graded.unwrap_or_default();
        let has_full_list = !graded.questions.is_empty();

        let grader_questions = if has_full_list {
            graded.questions
        } else {
            records_from_wrong_items(&graded.wrong_items)
        };

        let mut bank = build_bank(
            &ctx.session_id,
            ctx.subject,
            raw_text,
            grader_questions,
            request.images.clone(),
        );
        bank.vision_provider = request.vision_provider;

        response.wrong_items = if has_full_list {
            let graded_questions: Vec<QuestionRecord> = bank
                .questions
                .iter()
                .filter(|q| q.reason != NOT_GRADED)
                .cloned()
                .collect();
            wrong_items::canonicalize(&graded_questions, Vec::new())
        } else {
            wrong_items::canonicalize(&[], graded.wrong_items)
        };
        response.summary = graded.summary;
        response.questions = bank.questions.clone();
        response.vision_raw_text = raw_text.to_string();
        response.meta.bank_source = bank.source.as_str().to_string();
        response.status = status;

        response
            .timings_ms
            .insert("bank_ms".to_string(), timer.elapsed_ms());
        response
            .timings_ms
            .insert("total_ms".to_string(), total.elapsed_ms());
        bank.timings_ms = response.timings_ms.clone();

        if let Err(message) = self.persist(ctx, &mut bank).await {
            response.warnings.push(message);
        }
        self.snapshots.record(&response).await;

        info!(
            "{} 🏁 批改结束: {:?}, {} 题, {} 道错题, {} 条警告, 用时 {}ms",
            ctx,
            response.status,
            response.questions.len(),
            response.wrong_items.len(),
            response.warnings.len(),
            total.elapsed_ms()
        );
        response
    }

    async fn persist(&self, ctx: &GradeCtx, bank: &mut QuestionBank) -> Result<(), String> {
        let _guard = self.locks.lock(&ctx.session_id).await;
        self.sessions.save_bank(bank).await.map_err(|e| {
            error!("{} ❌ 题库保存失败: {}", ctx, e);
            format!("question bank not saved: {}", e)
        })
    }
}

// ========== 辅助函数 ==========

/// 批改模型只给了错题列表时，把它当作题目列表参与建库
fn records_from_wrong_items(items: &[WrongItem]) -> Vec<QuestionRecord> {
    items
        .iter()
        .filter(|item| !item.question_number.trim().is_empty())
        .map(|item| QuestionRecord {
            question_number: item.question_number.clone(),
            content: item.question_content.clone(),
            student_answer: item.student_answer.clone(),
            verdict: Verdict::Incorrect,
            reason: item.reason.clone(),
            warnings: item.warnings.clone(),
            knowledge_tags: item.knowledge_tags.clone(),
            first_wrong_step: item.first_wrong_step.clone(),
            ..Default::default()
        })
        .collect()
}
