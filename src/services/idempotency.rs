//! 幂等保护 - 业务能力层
//!
//! 同一个幂等键 + 同一份请求指纹：原样重放第一次的响应（逐字节一致）。
//! 同一个幂等键 + 不同指纹：冲突，且不覆盖已有记录。

use crate::error::AppResult;
use crate::infrastructure::kv_store::{get_json, set_json, KvStore};
use crate::models::grade::GradeRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 已缓存的响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// 序列化后的响应体，重放时原样返回
    pub response: String,
    pub status_code: u16,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// 幂等检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// 没有记录，正常处理
    Fresh,
    /// 指纹一致，重放
    Replay(IdempotencyRecord),
    /// 指纹不一致
    Conflict,
}

/// 请求指纹：学科 + 服务商 + 模式 + 会话 + 每张图片（URL 原文或内容摘要）
pub fn fingerprint(request: &GradeRequest, force_async: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.subject.code().as_bytes());
    hasher.update(b"|");
    hasher.update(request.vision_provider.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(
        request
            .llm_provider
            .map(|p| p.as_str())
            .unwrap_or("-")
            .as_bytes(),
    );
    hasher.update(b"|");
    hasher.update(request.mode.as_bytes());
    hasher.update(if force_async { b"|async" } else { b"|sync " });
    hasher.update(b"|");
    hasher.update(request.session_id.as_deref().unwrap_or("").as_bytes());

    for image in &request.images {
        hasher.update(b"|");
        match (&image.url, &image.base64) {
            (Some(url), _) if !url.trim().is_empty() => {
                hasher.update(b"url:");
                hasher.update(url.trim().as_bytes());
            }
            (_, Some(payload)) => {
                hasher.update(b"b64:");
                hasher.update(short_digest(payload).as_bytes());
            }
            _ => hasher.update(b"empty"),
        }
    }

    hex::encode(hasher.finalize())
}

/// 大图片内容的短摘要
fn short_digest(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(&digest[..8])
}

/// 幂等记录读写
pub struct IdempotencyGuard {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(idempotency_key: &str) -> String {
        format!("idem:{}", idempotency_key)
    }

    /// 检查幂等键
    ///
    /// # 参数
    /// - `idempotency_key`: 客户端提供的幂等键
    /// - `fingerprint`: 本次请求的指纹
    pub async fn check(&self, idempotency_key: &str, fingerprint: &str) -> AppResult<IdempotencyCheck> {
        let record: Option<IdempotencyRecord> =
            get_json(self.store.as_ref(), &Self::key(idempotency_key)).await?;
        Ok(match record {
            None => IdempotencyCheck::Fresh,
            Some(record) if record.fingerprint == fingerprint => {
                debug!("幂等重放: {}", idempotency_key);
                IdempotencyCheck::Replay(record)
            }
            Some(_) => {
                warn!("⚠️ 幂等键 {} 被不同的请求复用", idempotency_key);
                IdempotencyCheck::Conflict
            }
        })
    }

    /// 记录响应；已有不同指纹的记录时不覆盖
    pub async fn store(
        &self,
        idempotency_key: &str,
        fingerprint: &str,
        status_code: u16,
        response: String,
    ) -> AppResult<()> {
        let key = Self::key(idempotency_key);
        let existing: Option<IdempotencyRecord> = get_json(self.store.as_ref(), &key).await?;
        if let Some(existing) = existing {
            if existing.fingerprint != fingerprint {
                warn!("⚠️ 幂等键 {} 已有其他请求的记录，跳过写入", idempotency_key);
                return Ok(());
            }
        }

        let record = IdempotencyRecord {
            response,
            status_code,
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
        };
        set_json(self.store.as_ref(), &key, &record, self.ttl).await
    }
}
