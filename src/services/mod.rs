pub mod corrections;
pub mod focus_router;
pub mod grading_service;
pub mod idempotency;
pub mod json_repair;
pub mod prompts;
pub mod question_bank;
pub mod relook;
pub mod session_store;
pub mod snapshot_writer;
pub mod validation;
pub mod vision_service;
pub mod wrong_items;

pub use focus_router::{route_focus, FocusDecision};
pub use grading_service::{GraderOutput, GradingFailure, GradingOutput, GradingService};
pub use idempotency::{IdempotencyCheck, IdempotencyGuard, IdempotencyRecord};
pub use session_store::SessionStore;
pub use snapshot_writer::SnapshotWriter;
pub use vision_service::{AttemptKind, VisionFailure, VisionOutput, VisionService};
