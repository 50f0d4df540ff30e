//! 题目、错题与题库
//!
//! 题库以题号字符串为键（支持 "15(2)②" 这类复合题号），而不是数组下标：
//! 聊天时的题目绑定依赖题号在整个会话生命周期内保持稳定。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::grade::ImageRef;
use super::provider::VisionProvider;
use super::subject::Subject;

/// 判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Incorrect,
    #[default]
    Uncertain,
}

impl Verdict {
    /// 宽松解析模型输出
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "correct" | "right" | "对" | "正确" | "✓" => Verdict::Correct,
            "incorrect" | "wrong" | "错" | "错误" | "✗" => Verdict::Incorrect,
            _ => Verdict::Uncertain,
        }
    }
}

/// 作答状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStatus {
    Answered,
    Blank,
    #[default]
    Uncertain,
}

/// 单题记录（题库中的规范记录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuestionRecord {
    pub question_number: String,
    pub content: String,
    pub student_answer: String,
    pub options: Vec<String>,
    pub verdict: Verdict,
    pub reason: String,
    pub warnings: Vec<String>,
    pub knowledge_tags: Vec<String>,
    pub answer_status: AnswerStatus,
    /// 第一个不正确的解题步骤（仅保留一步）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_wrong_step: Option<String>,
}

/// 错题（不正确或不确定的题目）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WrongItem {
    /// 由题号确定性生成：`q:<题号>`，重复时追加 `#2`、`#3`…
    pub item_id: String,
    pub question_number: String,
    pub reason: String,
    pub question_content: String,
    pub student_answer: String,
    pub warnings: Vec<String>,
    pub knowledge_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_wrong_step: Option<String>,
}

/// 题库来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BankSource {
    /// 批改结果 + 原文重建合并
    #[default]
    Reconciled,
    /// 批改失败，仅原文重建
    TextOnly,
    /// 原文中找不到任何题号
    Placeholder,
}

impl BankSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BankSource::Reconciled => "reconciled",
            BankSource::TextOnly => "text_only",
            BankSource::Placeholder => "placeholder",
        }
    }
}

/// 会话题库
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionBank {
    pub session_id: String,
    pub subject: Subject,
    pub source: BankSource,
    /// 按出现顺序排列，题号唯一
    pub questions: Vec<QuestionRecord>,
    /// 原始页面图片（重新识图时使用）
    pub page_images: Vec<ImageRef>,
    /// 批改时使用的识图服务商，重新识图沿用
    #[serde(default)]
    pub vision_provider: VisionProvider,
    pub vision_raw_text: String,
    pub timings_ms: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuestionBank {
    pub fn new(session_id: impl Into<String>, subject: Subject) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            subject,
            source: BankSource::default(),
            questions: Vec::new(),
            page_images: Vec::new(),
            vision_provider: VisionProvider::default(),
            vision_raw_text: String::new(),
            timings_ms: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, question_number: &str) -> Option<&QuestionRecord> {
        self.questions
            .iter()
            .find(|q| q.question_number == question_number)
    }

    pub fn get_mut(&mut self, question_number: &str) -> Option<&mut QuestionRecord> {
        self.questions
            .iter_mut()
            .find(|q| q.question_number == question_number)
    }

    /// 插入或覆盖同题号记录，保持首次出现的位置
    pub fn upsert(&mut self, record: QuestionRecord) {
        match self.get_mut(&record.question_number) {
            Some(existing) => *existing = record,
            None => self.questions.push(record),
        }
    }

    pub fn question_numbers(&self) -> Vec<String> {
        self.questions
            .iter()
            .map(|q| q.question_number.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// 题号规范化：全角括号/点转半角，去空白
pub fn normalize_question_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '（' => '(',
            '）' => ')',
            '．' => '.',
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            other => other,
        })
        .collect::<String>()
        .trim_end_matches(['.', '、'])
        .to_string()
}
