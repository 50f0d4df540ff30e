//! 重新识图判定
//!
//! 绑定到某道题后，如果怀疑题干/图被看错，就只针对这道题重新跑一次识图，
//! 用识别到的内容修补题库。每道题每个会话最多一次。

use crate::models::question::QuestionRecord;
use crate::services::question_bank::parse_text_questions;
use regex::Regex;
use std::sync::LazyLock;

/// 短题干阈值（字符数）
const SHORT_STEM_CHARS: usize = 18;

const PUSHBACK_MARKERS: &[&str] = &[
    "看错", "识别错", "认错", "抄错", "题目不对", "题目不是", "不是这道题", "图不对", "misread",
    "wrong question", "that's not the question",
];
const SEQUENCE_MARKERS: &[&str] = &["规律", "数列", "找规律", "依次", "pattern", "sequence"];
const DIAGRAM_MARKERS: &[&str] = &["如图", "图中", "下图", "右图", "图示", "diagram", "figure"];

static NUMBER_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d+(?:\.\d+)?\s*[,，、\s]\s*-?\d+(?:\.\d+)?\s*[,，、\s]\s*-?\d+").expect("valid regex")
});

/// 需要重新识图的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelookReason {
    /// 用户明确说识别错了
    UserPushback,
    /// 找规律题，题干里却没有数列本身
    SequenceWithoutEvidence,
    /// 题干很短却引用了图
    ShortDiagramStem,
}

impl RelookReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RelookReason::UserPushback => "user pushback",
            RelookReason::SequenceWithoutEvidence => "sequence stem without the sequence",
            RelookReason::ShortDiagramStem => "short stem referencing a diagram",
        }
    }
}

/// 判断是否需要重新识图
pub fn relook_reason(record: &QuestionRecord, message: &str) -> Option<RelookReason> {
    let lower_message = message.to_lowercase();
    if PUSHBACK_MARKERS.iter().any(|m| lower_message.contains(m)) {
        return Some(RelookReason::UserPushback);
    }

    let stem = record.content.to_lowercase();
    if SEQUENCE_MARKERS.iter().any(|m| stem.contains(m)) && !NUMBER_RUN.is_match(&stem) {
        return Some(RelookReason::SequenceWithoutEvidence);
    }

    if stem.chars().count() < SHORT_STEM_CHARS && DIAGRAM_MARKERS.iter().any(|m| stem.contains(m)) {
        return Some(RelookReason::ShortDiagramStem);
    }

    None
}

/// 只针对一道题的识图提示词
pub fn relook_prompt(question_number: &str) -> String {
    format!(
        "请只看第{n}题，完整转写题干、所有选项以及图中的关键信息（数字、标注、数列）。\n\
         输出格式：\n### 第{n}题\n题目：……\nA. ……\n学生作答：……\n\
         不要批改，不要解题。",
        n = question_number
    )
}

/// 用重新识图的结果修补题目记录
///
/// # 返回
/// 是否有字段被修改
pub fn apply_relook(record: &mut QuestionRecord, relook_text: &str) -> bool {
    let questions = parse_text_questions(relook_text);
    let Some(recovered) = questions
        .iter()
        .find(|q| q.question_number == record.question_number)
        .or_else(|| questions.first())
    else {
        // 没有题号边界时把整段当作题干
        let text = relook_text.trim();
        if text.chars().count() > record.content.chars().count() {
            record.content = text.to_string();
            return true;
        }
        return false;
    };

    let mut changed = false;
    if !recovered.content.is_empty() && recovered.content != record.content {
        record.content = recovered.content.clone();
        changed = true;
    }
    if !recovered.options.is_empty() && recovered.options != record.options {
        record.options = recovered.options.clone();
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &str) -> QuestionRecord {
        QuestionRecord {
            question_number: "7".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    #[test]
    fn pushback_triggers_relook() {
        assert_eq!(
            relook_reason(&record("计算 12×3 的结果，并写出过程"), "你看错题了吧"),
            Some(RelookReason::UserPushback)
        );
    }

    #[test]
    fn sequence_without_numbers_triggers_relook() {
        assert_eq!(
            relook_reason(&record("观察下面的数，找出规律并填空"), "怎么做"),
            Some(RelookReason::SequenceWithoutEvidence)
        );
        assert_eq!(
            relook_reason(&record("找规律：2, 4, 8, 16, ( )"), "怎么做"),
            None
        );
    }

    #[test]
    fn short_diagram_stem_triggers_relook() {
        assert_eq!(
            relook_reason(&record("如图，求x"), "怎么做"),
            Some(RelookReason::ShortDiagramStem)
        );
        assert_eq!(
            relook_reason(&record("如图，长方形ABCD中AB=6，BC=4，E是CD中点，求三角形ABE面积"), "怎么做"),
            None
        );
    }

    #[test]
    fn relook_patches_content_and_options() {
        let mut q = record("如图，求x");
        let text = "### 第7题\n题目：如图，直角三角形两直角边为3和4，求斜边x\nA. 5\nB. 6";
        assert!(apply_relook(&mut q, text));
        assert_eq!(q.content, "如图，直角三角形两直角边为3和4，求斜边x");
        assert_eq!(q.options, vec!["A. 5", "B. 6"]);

        // 同样的内容再修补一次不算修改
        assert!(!apply_relook(&mut q, text));
    }
}
