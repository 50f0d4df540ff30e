pub mod chat_flow;
pub mod grade_ctx;
pub mod grade_flow;
pub mod stage_outcome;

pub use chat_flow::ChatFlow;
pub use grade_ctx::GradeCtx;
pub use grade_flow::GradeFlow;
pub use stage_outcome::StageOutcome;
