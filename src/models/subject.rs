use serde::{Deserialize, Serialize};

/// 科目枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    /// 数学
    Math,
    /// 英语
    English,
}

impl Subject {
    /// 获取标准名称
    pub fn name(self) -> &'static str {
        match self {
            Subject::Math => "数学",
            Subject::English => "英语",
        }
    }

    /// 线上协议使用的编码
    pub fn code(self) -> &'static str {
        match self {
            Subject::Math => "math",
            Subject::English => "english",
        }
    }

    /// 尝试从字符串解析科目（精确匹配）
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "math" | "数学" | "数" => Some(Subject::Math),
            "english" | "英语" | "英" => Some(Subject::English),
            _ => None,
        }
    }

    /// 智能查找科目（支持模糊匹配）
    pub fn find(s: &str) -> Option<Self> {
        if let Some(subject) = Self::from_str(s) {
            return Some(subject);
        }

        let s_lower = s.to_lowercase();
        if s_lower.contains("math") || s_lower.contains("数") {
            return Some(Subject::Math);
        }
        if s_lower.contains("english") || s_lower.contains("英") {
            return Some(Subject::English);
        }
        None
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
