//! 会话存储 - 业务能力层
//!
//! 题库与会话都按 session id 存放在 KV 存储里，共用同一个 TTL。
//! 读-改-写必须在 `SessionLocks` 持有的锁内完成。

use crate::error::AppResult;
use crate::infrastructure::{get_json, set_json, KvStore};
use crate::models::question::QuestionBank;
use crate::models::session::Session;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct SessionStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn bank_key(session_id: &str) -> String {
        format!("qbank:{}", session_id)
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub async fn load_bank(&self, session_id: &str) -> AppResult<Option<QuestionBank>> {
        get_json(self.store.as_ref(), &Self::bank_key(session_id)).await
    }

    /// 写入题库（刷新 TTL）
    pub async fn save_bank(&self, bank: &mut QuestionBank) -> AppResult<()> {
        bank.updated_at = Utc::now();
        debug!("保存题库: 会话 {} | {} 题", bank.session_id, bank.len());
        set_json(
            self.store.as_ref(),
            &Self::bank_key(&bank.session_id),
            bank,
            self.ttl,
        )
        .await
    }

    pub async fn load_session(&self, session_id: &str) -> AppResult<Option<Session>> {
        get_json(self.store.as_ref(), &Self::session_key(session_id)).await
    }

    /// 写入会话（刷新 TTL）
    pub async fn save_session(&self, session: &mut Session) -> AppResult<()> {
        session.updated_at = Utc::now();
        set_json(
            self.store.as_ref(),
            &Self::session_key(&session.session_id),
            session,
            self.ttl,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::MemoryKvStore;
    use crate::models::subject::Subject;

    #[tokio::test(start_paused = true)]
    async fn bank_expires_with_ttl() {
        let store = SessionStore::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(10));
        let mut bank = QuestionBank::new("s1", Subject::Math);
        store.save_bank(&mut bank).await.unwrap();
        assert!(store.load_bank("s1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.load_bank("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_round_trips() {
        let store = SessionStore::new(Arc::new(MemoryKvStore::new()), Duration::from_secs(10));
        let mut session = Session::new("s1");
        session.focus_question_number = Some("3".into());
        store.save_session(&mut session).await.unwrap();

        let loaded = store.load_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.focus_question_number.as_deref(), Some("3"));
    }
}
