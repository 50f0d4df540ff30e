//! 批改请求与响应

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::provider::{LlmProvider, VisionProvider};
use super::question::{QuestionRecord, WrongItem};
use super::subject::Subject;

/// 单张内联图片的字节上限（客户端上传与服务端下载都适用）
pub const MAX_INLINE_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// 图片引用：公网 URL 或内联 base64（两者都给时优先 URL）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImageRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

impl ImageRef {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            base64: None,
        }
    }

    pub fn from_base64(payload: impl Into<String>) -> Self {
        Self {
            url: None,
            base64: Some(payload.into()),
        }
    }

    /// 交给模型的图片地址：URL 原样，base64 转 data URI
    pub fn model_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.to_string());
        }
        self.base64.as_deref().map(to_data_uri)
    }

    pub fn is_url(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// 裸 base64 补全为 data URI；已经是 data URI 的原样返回
pub fn to_data_uri(payload: &str) -> String {
    if payload.starts_with("data:") {
        payload.to_string()
    } else {
        format!("data:image/jpeg;base64,{}", payload)
    }
}

/// 批改请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeRequest {
    pub subject: Subject,
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub vision_provider: VisionProvider,
    #[serde(default)]
    pub llm_provider: Option<LlmProvider>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// 批改模式（参与幂等指纹）
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "normal".to_string()
}

/// 批改状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradeStatus {
    Processing,
    Done,
    Failed,
    Rejected,
}

/// 执行过程元信息（兜底路径必须显式上报）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GradeMeta {
    pub vision_provider_requested: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision_provider_used: Option<String>,
    pub vision_used_proxy_url: bool,
    pub vision_used_base64_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider_used: Option<String>,
    pub grading_fallback_used: bool,
    pub bank_source: String,
}

/// 批改响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResponse {
    pub request_id: String,
    pub session_id: String,
    pub status: GradeStatus,
    pub subject: Subject,
    pub wrong_items: Vec<WrongItem>,
    pub questions: Vec<QuestionRecord>,
    pub vision_raw_text: String,
    pub warnings: Vec<String>,
    pub timings_ms: BTreeMap<String, u64>,
    pub meta: GradeMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl GradeResponse {
    pub fn new(request_id: &str, session_id: &str, subject: Subject, status: GradeStatus) -> Self {
        Self {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            status,
            subject,
            wrong_items: Vec::new(),
            questions: Vec::new(),
            vision_raw_text: String::new(),
            warnings: Vec::new(),
            timings_ms: BTreeMap::new(),
            meta: GradeMeta::default(),
            summary: None,
        }
    }
}
