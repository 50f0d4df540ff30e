//! 辅导会话状态

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::subject::Subject;

/// 会话历史最多保留的消息条数
pub const HISTORY_WINDOW: usize = 20;
/// 每道题保留的用户更正条数
pub const MAX_CORRECTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 会话：NEW → BOUND(题号) → BOUND(题号')…，TTL 到期即终止
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub history: Vec<ChatMessage>,
    pub focus_question_number: Option<String>,
    /// 题号 → 用户更正（保留最近 5 条）
    pub corrections: BTreeMap<String, Vec<String>>,
    /// 已经重新识图过的题号
    #[serde(default)]
    pub relooked: Vec<String>,
    pub interaction_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            focus_question_number: None,
            corrections: BTreeMap::new(),
            relooked: Vec::new(),
            interaction_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.history.push(message);
        if self.history.len() > HISTORY_WINDOW {
            let overflow = self.history.len() - HISTORY_WINDOW;
            self.history.drain(..overflow);
        }
    }

    pub fn add_correction(&mut self, question_number: &str, correction: String) {
        let log = self
            .corrections
            .entry(question_number.to_string())
            .or_default();
        if log.last() == Some(&correction) {
            return;
        }
        log.push(correction);
        if log.len() > MAX_CORRECTIONS {
            let overflow = log.len() - MAX_CORRECTIONS;
            log.drain(..overflow);
        }
    }

    pub fn corrections_for(&self, question_number: &str) -> &[String] {
        self.corrections
            .get(question_number)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// 辅导请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    /// 本轮用户输入
    pub question: String,
    /// 客户端保存的历史，仅在服务端没有会话记录时用于初始化
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub subject: Option<Subject>,
}

/// 推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ChatEvent {
    /// 等待模型期间的保活
    Heartbeat { elapsed_ms: u64 },
    /// 截至目前的完整回复
    Chat {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        question_number: Option<String>,
    },
    Done {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        question_number: Option<String>,
        interaction_count: u64,
    },
    Error { message: String },
}

impl ChatEvent {
    /// SSE 事件名
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Heartbeat { .. } => "heartbeat",
            ChatEvent::Chat { .. } => "chat",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_windowed() {
        let mut session = Session::new("s");
        for i in 0..25 {
            session.push_message(ChatMessage::user(format!("m{i}")));
        }
        assert_eq!(session.history.len(), HISTORY_WINDOW);
        assert_eq!(session.history[0].content, "m5");
    }

    #[test]
    fn corrections_keep_last_five() {
        let mut session = Session::new("s");
        for i in 0..7 {
            session.add_correction("3", format!("c{i}"));
        }
        assert_eq!(session.corrections_for("3"), ["c2", "c3", "c4", "c5", "c6"]);
        assert!(session.corrections_for("4").is_empty());
    }

    #[test]
    fn chat_event_wire_shape() {
        let event = ChatEvent::Chat {
            content: "先看第一步".into(),
            question_number: Some("3".into()),
        };
        assert_eq!(event.name(), "chat");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"event": "chat", "content": "先看第一步", "question_number": "3"})
        );
    }
}
