//! 用户更正识别
//!
//! 学生经常纠正识图结果（"不是b³，是b²"）。识别出的更正会记在当前题下，
//! 之后每一轮都作为已确认事实放进上下文。

use regex::Regex;
use std::sync::LazyLock;

static NOT_X_BUT_Y: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"不是\s*(?P<wrong>[^，,。；;！!？?]{1,24}?)\s*[，,]?\s*(?:而)?是\s*(?P<right>[^，,。；;！!？?]{1,24})")
        .expect("valid regex")
});
static ENGLISH_NOT_X_BUT_Y: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)it'?s\s+not\s+(?P<wrong>[^,.;!?]{1,24}?)\s*[,;]?\s*(?:it'?s|but)\s+(?P<right>[^,.;!?]{1,24})")
        .expect("valid regex")
});
static SHOULD_BE_Y: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:应该是|应为|原题是|题目里是|题目写的是)\s*(?P<right>[^，,。；;！!？?]{1,30})")
        .expect("valid regex")
});

/// 从用户输入中识别一条更正
///
/// # 返回
/// 规范化后的更正文本，例如 `不是 b³，是 b²`
pub fn detect_correction(message: &str) -> Option<String> {
    if let Some(caps) = NOT_X_BUT_Y.captures(message) {
        let whole = caps.get(0)?;
        // "是不是…" 是提问，不是更正
        if !message[..whole.start()].ends_with('是') {
            return Some(format!(
                "不是 {}，是 {}",
                caps["wrong"].trim(),
                caps["right"].trim()
            ));
        }
    }
    if let Some(caps) = ENGLISH_NOT_X_BUT_Y.captures(message) {
        return Some(format!(
            "it's not {}, it's {}",
            caps["wrong"].trim(),
            caps["right"].trim()
        ));
    }
    SHOULD_BE_Y
        .captures(message)
        .map(|caps| format!("应为 {}", caps["right"].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_not_x_but_y() {
        assert_eq!(
            detect_correction("题目看错了，不是b³，是b²").as_deref(),
            Some("不是 b³，是 b²")
        );
        assert_eq!(
            detect_correction("不是3而是5").as_deref(),
            Some("不是 3，是 5")
        );
    }

    #[test]
    fn english_form() {
        assert_eq!(
            detect_correction("No, it's not b³, it's b²").as_deref(),
            Some("it's not b³, it's b²")
        );
    }

    #[test]
    fn should_be_form() {
        assert_eq!(
            detect_correction("第二个数应该是12").as_deref(),
            Some("应为 12")
        );
    }

    #[test]
    fn questions_are_not_corrections() {
        assert!(detect_correction("是不是这样做是对的？").is_none());
        assert!(detect_correction("这道题怎么做？").is_none());
    }
}
