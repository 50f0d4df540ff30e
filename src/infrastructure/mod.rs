//! 基础设施层：只持有稀缺的共享资源，只暴露能力

pub mod budget;
pub mod kv_store;
pub mod pools;
pub mod session_lock;

pub use budget::{Budget, StageTimer};
pub use kv_store::{get_json, set_json, KvStore, MemoryKvStore};
pub use pools::ProviderPools;
pub use session_lock::SessionLocks;
