//! 带 TTL 的键值存储 - 基础设施层
//!
//! 题库、会话、任务、幂等记录都存放在这里（分别以 session id / job id / 幂等键为键）。
//! 对外只暴露 get / set / delete 能力；生产环境可换成 Redis 等外部实现。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::AppResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()>;
    async fn delete(&self, key: &str) -> AppResult<()>;
}

/// 读取并反序列化
pub async fn get_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> AppResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// 序列化并写入
pub async fn set_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> AppResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw, ttl).await
}

/// 进程内实现
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> AppResult<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
