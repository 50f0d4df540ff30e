//! 阶段结果
//!
//! 流程驱动只根据这个枚举决定"继续 / 降级 / 立即返回"。

use crate::models::grade::GradeResponse;

/// 单个阶段的结果
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// 阶段成功，继续下一阶段
    Success(T),
    /// 阶段失败但可以降级继续（例如批改失败时仍用原文建题库）
    Recoverable(String),
    /// 不能继续，直接返回这个响应（已落库）
    Fatal(Box<GradeResponse>),
}
