//! 外部模型服务商

use serde::{Deserialize, Serialize};

/// 识图服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisionProvider {
    /// 可靠接受任意 URL，失败即整体失败
    #[default]
    Qwen,
    /// 服务端拉取客户端 URL 偶发失败，走分层兜底
    Doubao,
}

impl VisionProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            VisionProvider::Qwen => "qwen",
            VisionProvider::Doubao => "doubao",
        }
    }

    /// 是否需要"代理 URL → 本地下载转 base64"兜底链
    pub fn has_flaky_url_fetch(self) -> bool {
        matches!(self, VisionProvider::Doubao)
    }

    /// 服务商能否接收这种形式的图片
    ///
    /// qwen 只按 URL 调用；doubao 额外接受内联 base64（它自己的兜底链也依赖这一点）。
    pub fn accepts(self, form: ImageForm) -> bool {
        match form {
            ImageForm::Url => true,
            ImageForm::InlineBase64 => matches!(self, VisionProvider::Doubao),
        }
    }

    /// 识图与文本模型由同一家服务商提供
    pub fn endpoint(self) -> LlmProvider {
        match self {
            VisionProvider::Qwen => LlmProvider::Qwen,
            VisionProvider::Doubao => LlmProvider::Doubao,
        }
    }
}

/// 图片交给识图服务商的形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageForm {
    Url,
    InlineBase64,
}

impl ImageForm {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageForm::Url => "url",
            ImageForm::InlineBase64 => "inline base64",
        }
    }
}

/// 文本推理服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Doubao,
    Qwen,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::Doubao => "doubao",
            LlmProvider::Qwen => "qwen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "doubao" | "ark" => Some(LlmProvider::Doubao),
            "qwen" | "dashscope" => Some(LlmProvider::Qwen),
            _ => None,
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for VisionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
