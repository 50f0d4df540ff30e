pub mod grade;
pub mod job;
pub mod provider;
pub mod question;
pub mod session;
pub mod subject;

pub use grade::{GradeMeta, GradeRequest, GradeResponse, GradeStatus, ImageRef};
pub use job::{JobRecord, JobStatus};
pub use provider::{ImageForm, LlmProvider, VisionProvider};
pub use question::{
    normalize_question_number, AnswerStatus, BankSource, QuestionBank, QuestionRecord, Verdict,
    WrongItem,
};
pub use session::{ChatEvent, ChatMessage, ChatRequest, ChatRole, Session};
pub use subject::Subject;
