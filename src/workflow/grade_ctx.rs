//! 批改上下文
//!
//! 封装"我正在处理哪个请求、属于哪个会话、还剩多少时间"这一信息

use std::fmt::Display;

use crate::infrastructure::Budget;
use crate::models::subject::Subject;

/// 批改上下文
///
/// 一个请求一份，随请求创建、随请求结束
#[derive(Debug, Clone)]
pub struct GradeCtx {
    /// 请求ID
    pub request_id: String,

    /// 会话ID（题库按此存放）
    pub session_id: String,

    pub subject: Subject,

    /// 请求级时间预算，创建时开始计时
    pub budget: Budget,
}

impl GradeCtx {
    pub fn new(request_id: String, session_id: String, subject: Subject, budget: Budget) -> Self {
        Self {
            request_id,
            session_id,
            subject,
            budget,
        }
    }
}

impl Display for GradeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[批改 #{} 会话 #{} {}]",
            short_id(&self.request_id),
            short_id(&self.session_id),
            self.subject.name()
        )
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
