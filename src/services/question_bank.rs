//! 题库构建 - 业务能力层
//!
//! 两件事：
//! 1. 从识图原文按固定文法重建每道题（题号边界 → 题干 / 作答 / 状态 / 选项 / 误读提示）
//! 2. 与批改模型输出按题号合并，原文非空的字段优先，防止批改模型改写题干
//!
//! 文法（可单独测试）：
//! - 题号边界：整行只有题号加句点（`3.`、`15(2)②.`、`第3题`），或 markdown 标题（`### 第3题`、`### Question 3`）
//! - 题干：边界之后、遇到"作答 / 作答状态 / 步骤"标签之前的内容，`题目:` 标签会被去掉
//! - 作答：`学生作答:` / `作答:` / `答案:` 之后的内容，可跨行
//! - 状态：`作答状态:` / `状态:`，取值 已作答 / 未作答 / 不确定
//! - 选项：`A.` ~ `D.` 开头的行，或同一行内的多个选项
//! - `步骤:` / `解题过程:` 之后的内容忽略
//! - 含"可能误读"等字样的行记为警告

use crate::models::grade::ImageRef;
use crate::models::question::{
    normalize_question_number, AnswerStatus, BankSource, QuestionBank, QuestionRecord, Verdict,
};
use crate::models::subject::Subject;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// 批改失败时的原因
pub const GRADING_INCOMPLETE: &str = "grading incomplete";
/// 原文中有、批改结果里没有的题
pub const NOT_GRADED: &str = "not graded";
/// 找不到任何题号时的占位题号
pub const PLACEHOLDER_NUMBER: &str = "N/A";
/// 批改结果里缺题号时的临时题号前缀，按出现顺序编号
pub const UNNUMBERED_PREFIX: &str = "未编号-";

const QUESTION_NUMBER: &str = r"\d+(?:\s*[(（]\s*\d+\s*[)）])*\s*[①-⑳]?";

static BARE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\s*(?:第\s*(?P<a>{n})\s*题\s*[.．、:：]?|(?P<b>{n})\s*[.．、])\s*$",
        n = QUESTION_NUMBER
    ))
    .expect("valid regex")
});
static HEADING_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\s*#{{1,6}}\s*(?:第\s*(?P<a>{n})\s*题|(?i:question|题目|题)\s*(?P<b>{n})|(?P<c>{n}))\s*[.．、:：]?\s*(?P<rest>.*)$",
        n = QUESTION_NUMBER
    ))
    .expect("valid regex")
});
static STATUS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]*\s*(?:\*\*)?(?:作答状态|答题状态|状态|(?i:answer\s+status|status))(?:\*\*)?\s*[:：]\s*(?P<v>.*)$")
        .expect("valid regex")
});
static ANSWER_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]*\s*(?:\*\*)?(?:学生作答|学生答案|作答|答案|(?i:student\s+answer|answer))(?:\*\*)?\s*[:：]\s*(?P<v>.*)$")
        .expect("valid regex")
});
static STEPS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]*\s*(?:\*\*)?(?:解题步骤|解题过程|步骤|(?i:steps?|solution))(?:\*\*)?\s*[:：]?")
        .expect("valid regex")
});
static STEM_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]*\s*(?:\*\*)?(?:题目|题干|(?i:stem|question))(?:\*\*)?\s*[:：]\s*(?P<v>.*)$")
        .expect("valid regex")
});
static OPTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(?:[(（](?P<p>[A-D])[)）]|(?P<d>[A-D])\s*[.．、:：)）])\s*")
        .expect("valid regex")
});

const MISREAD_MARKERS: &[&str] = &["可能误读", "可能识别错误", "识别存疑", "possible misreading"];
const BLANK_ANSWERS: &[&str] = &["无", "空", "（空）", "(空)", "未作答", "-", "—", "none"];

/// 从原文重建出的单题
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextQuestion {
    pub question_number: String,
    pub content: String,
    pub student_answer: String,
    pub options: Vec<String>,
    /// 原文给出或可推断的作答状态
    pub answer_status: Option<AnswerStatus>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum BlockState {
    Stem,
    Answer,
    Status,
    Steps,
}

/// 按文法把原文切分成题目
pub fn parse_text_questions(raw_text: &str) -> Vec<TextQuestion> {
    let mut blocks: Vec<(String, Vec<&str>)> = Vec::new();

    for line in raw_text.lines() {
        if let Some((number, rest)) = match_boundary(line) {
            let mut lines = Vec::new();
            if !rest.is_empty() {
                lines.push(rest);
            }
            blocks.push((number, lines));
        } else if let Some((_, lines)) = blocks.last_mut() {
            lines.push(line);
        }
    }

    let mut seen = HashSet::new();
    blocks
        .into_iter()
        .filter(|(number, _)| seen.insert(number.clone()))
        .map(|(number, lines)| parse_block(number, &lines))
        .collect()
}

/// 识别题号边界，返回（规范化题号, 标题行剩余文字）
fn match_boundary(line: &str) -> Option<(String, &str)> {
    if let Some(caps) = BARE_BOUNDARY.captures(line) {
        let number = caps.name("a").or_else(|| caps.name("b"))?;
        return Some((normalize_question_number(number.as_str()), ""));
    }
    let caps = HEADING_BOUNDARY.captures(line)?;
    let number = caps
        .name("a")
        .or_else(|| caps.name("b"))
        .or_else(|| caps.name("c"))?;
    let rest = caps.name("rest").map(|m| m.as_str().trim()).unwrap_or("");
    Some((normalize_question_number(number.as_str()), rest))
}

fn parse_block(question_number: String, lines: &[&str]) -> TextQuestion {
    let mut question = TextQuestion {
        question_number,
        ..Default::default()
    };
    let mut stem_lines: Vec<String> = Vec::new();
    let mut answer_lines: Vec<String> = Vec::new();
    let mut explicit_status = None;
    let mut state = BlockState::Stem;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_misread_warning(trimmed) {
            question.warnings.push(trimmed.to_string());
            continue;
        }
        if state == BlockState::Steps {
            continue;
        }
        if STEPS_LABEL.is_match(trimmed) && !ANSWER_LABEL.is_match(trimmed) {
            state = BlockState::Steps;
            continue;
        }
        if let Some(caps) = STATUS_LABEL.captures(trimmed) {
            explicit_status = parse_status(&caps["v"]);
            state = BlockState::Status;
            continue;
        }
        if let Some(caps) = ANSWER_LABEL.captures(trimmed) {
            let value = caps["v"].trim();
            if !value.is_empty() {
                answer_lines.push(value.to_string());
            }
            state = BlockState::Answer;
            continue;
        }
        if let Some(caps) = STEM_LABEL.captures(trimmed) {
            let value = caps["v"].trim();
            if !value.is_empty() {
                stem_lines.push(value.to_string());
            }
            state = BlockState::Stem;
            continue;
        }

        match state {
            BlockState::Stem => match extract_options(trimmed, !question.options.is_empty()) {
                Some(options) => question.options.extend(options),
                None => stem_lines.push(trimmed.to_string()),
            },
            BlockState::Answer => answer_lines.push(trimmed.to_string()),
            BlockState::Status | BlockState::Steps => {}
        }
    }

    question.content = stem_lines.join("\n");
    let answer = answer_lines.join("\n");
    let is_blank_marker = BLANK_ANSWERS
        .iter()
        .any(|b| answer.eq_ignore_ascii_case(b));
    question.student_answer = if is_blank_marker { String::new() } else { answer };

    question.answer_status = explicit_status.or_else(|| {
        if is_blank_marker {
            Some(AnswerStatus::Blank)
        } else if !question.student_answer.is_empty() {
            Some(AnswerStatus::Answered)
        } else {
            None
        }
    });

    question
}

fn is_misread_warning(line: &str) -> bool {
    let lower = line.to_lowercase();
    MISREAD_MARKERS.iter().any(|m| lower.contains(m))
}

fn parse_status(value: &str) -> Option<AnswerStatus> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }
    let status = if ["未作答", "未答", "空白", "blank", "unanswered", "empty"]
        .iter()
        .any(|m| value.contains(m))
    {
        AnswerStatus::Blank
    } else if ["不确定", "模糊", "看不清", "uncertain", "unclear"]
        .iter()
        .any(|m| value.contains(m))
    {
        AnswerStatus::Uncertain
    } else {
        AnswerStatus::Answered
    };
    Some(status)
}

/// 提取选项，返回 `["A. xxx", "B. yyy"]`
///
/// 单个 `B.` / `C.` 开头的行只有在已经见过选项时才算选项，
/// 避免 "A、B两地相距…" 这样的题干被误判。
fn extract_options(line: &str, has_previous: bool) -> Option<Vec<String>> {
    let markers: Vec<(usize, usize, char)> = OPTION_MARKER
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let letter = caps.name("p").or_else(|| caps.name("d"))?;
            letter.as_str().chars().next().map(|c| (whole.start(), whole.end(), c))
        })
        .collect();

    let (first_start, _, first_letter) = *markers.first()?;
    if !line[..first_start].trim().is_empty() {
        return None;
    }
    if markers.windows(2).any(|w| w[1].2 <= w[0].2) {
        return None;
    }
    if markers.len() == 1 && first_letter != 'A' && !has_previous {
        return None;
    }

    let mut options = Vec::with_capacity(markers.len());
    for (i, (_, end, letter)) in markers.iter().enumerate() {
        let next_start = markers.get(i + 1).map(|m| m.0).unwrap_or(line.len());
        let text = line[*end..next_start].trim();
        // "A、B两地" 这类：分隔符后紧跟另一个大写字母
        if markers.len() == 1 && text.starts_with(|c: char| ('B'..='D').contains(&c)) {
            return None;
        }
        options.push(format!("{}. {}", letter, text));
    }
    Some(options)
}

// ========== 合并 ==========

/// 合并批改结果与原文重建结果
///
/// # 参数
/// - `graded`: 批改模型给出的题目（可能为空）
/// - `text`: 原文重建出的题目
///
/// # 返回
/// 合并后的题目列表与来源标记
pub fn reconcile(
    graded: Vec<QuestionRecord>,
    text: Vec<TextQuestion>,
) -> (Vec<QuestionRecord>, BankSource) {
    if graded.is_empty() {
        if text.is_empty() {
            return (vec![placeholder_record()], BankSource::Placeholder);
        }
        let questions = text
            .into_iter()
            .map(|t| text_only_record(t, GRADING_INCOMPLETE))
            .collect();
        return (questions, BankSource::TextOnly);
    }

    let mut remaining: Vec<Option<TextQuestion>> = text.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(graded.len());
    let mut seen = HashSet::new();
    let mut unnumbered = 0;

    for mut record in graded {
        record.question_number = normalize_question_number(&record.question_number);
        if record.question_number.is_empty() {
            unnumbered += 1;
            record.question_number = format!("{}{}", UNNUMBERED_PREFIX, unnumbered);
            record
                .warnings
                .push("question number missing in grader output".to_string());
        }
        if !seen.insert(record.question_number.clone()) {
            continue;
        }
        let matched = remaining
            .iter_mut()
            .find(|t| {
                t.as_ref()
                    .is_some_and(|t| t.question_number == record.question_number)
            })
            .and_then(Option::take);
        if let Some(text_question) = matched {
            overlay_text(&mut record, text_question);
        }
        merged.push(record);
    }

    for text_question in remaining.into_iter().flatten() {
        if seen.insert(text_question.question_number.clone()) {
            debug!("原文中有、批改结果缺失的题: {}", text_question.question_number);
            merged.push(text_only_record(text_question, NOT_GRADED));
        }
    }

    (merged, BankSource::Reconciled)
}

/// 原文非空的字段覆盖批改结果；误读警告保序去重合并
fn overlay_text(record: &mut QuestionRecord, text: TextQuestion) {
    if !text.content.is_empty() {
        record.content = text.content;
    }
    if !text.student_answer.is_empty() {
        record.student_answer = text.student_answer;
    }
    if !text.options.is_empty() {
        record.options = text.options;
    }
    if let Some(status) = text.answer_status {
        record.answer_status = status;
    }
    let warnings = std::mem::take(&mut record.warnings);
    record.warnings = dedupe_preserving_order(warnings.into_iter().chain(text.warnings));
}

fn text_only_record(text: TextQuestion, reason: &str) -> QuestionRecord {
    QuestionRecord {
        question_number: text.question_number,
        content: text.content,
        student_answer: text.student_answer,
        options: text.options,
        verdict: Verdict::Uncertain,
        reason: reason.to_string(),
        warnings: dedupe_preserving_order(text.warnings),
        knowledge_tags: Vec::new(),
        answer_status: text.answer_status.unwrap_or_default(),
        first_wrong_step: None,
    }
}

fn placeholder_record() -> QuestionRecord {
    QuestionRecord {
        question_number: PLACEHOLDER_NUMBER.to_string(),
        verdict: Verdict::Uncertain,
        reason: GRADING_INCOMPLETE.to_string(),
        ..Default::default()
    }
}

/// 保序去重
pub fn dedupe_preserving_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// 由批改结果与原文构建会话题库
///
/// # 参数
/// - `session_id`: 会话ID
/// - `subject`: 学科
/// - `raw_text`: 识图原文（识图失败时为空）
/// - `graded`: 批改模型给出的题目（批改失败时为空）
/// - `page_images`: 原始页面图片，重新识图时使用
pub fn build_bank(
    session_id: &str,
    subject: Subject,
    raw_text: &str,
    graded: Vec<QuestionRecord>,
    page_images: Vec<ImageRef>,
) -> QuestionBank {
    let text_questions = parse_text_questions(raw_text);
    debug!(
        "原文重建 {} 题，批改结果 {} 题",
        text_questions.len(),
        graded.len()
    );
    let (questions, source) = reconcile(graded, text_questions);

    let mut bank = QuestionBank::new(session_id, subject);
    bank.questions = questions;
    bank.source = source;
    bank.page_images = page_images;
    bank.vision_raw_text = raw_text.to_string();
    bank
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
### 第1题
计算 1+2=?
学生作答：3
作答状态：已作答

15(2)②.
题目：下列哪个是质数
A. 4
B. 6
C. 7
D. 9
学生作答：C
步骤：
1. 判断每个数
可能误读：选项D可能是8

### Question 28(1)① 如图，求阴影面积
学生作答：（空）
";

    #[test]
    fn splits_blocks_on_boundaries() {
        let questions = parse_text_questions(SAMPLE);
        let numbers: Vec<_> = questions.iter().map(|q| q.question_number.as_str()).collect();
        assert_eq!(numbers, vec!["1", "15(2)②", "28(1)①"]);
    }

    #[test]
    fn extracts_stem_answer_status_and_options() {
        let questions = parse_text_questions(SAMPLE);

        assert_eq!(questions[0].content, "计算 1+2=?");
        assert_eq!(questions[0].student_answer, "3");
        assert_eq!(questions[0].answer_status, Some(AnswerStatus::Answered));

        let q15 = &questions[1];
        assert_eq!(q15.content, "下列哪个是质数");
        assert_eq!(q15.options, vec!["A. 4", "B. 6", "C. 7", "D. 9"]);
        assert_eq!(q15.student_answer, "C");
        assert_eq!(q15.warnings, vec!["可能误读：选项D可能是8"]);

        let q28 = &questions[2];
        assert_eq!(q28.content, "如图，求阴影面积");
        assert_eq!(q28.student_answer, "");
        assert_eq!(q28.answer_status, Some(AnswerStatus::Blank));
    }

    #[test]
    fn inline_options_on_one_line() {
        let raw = "3.\n选出正确答案\nA. 1  B. 2  C. 3  D. 4\n答案: B";
        let q = &parse_text_questions(raw)[0];
        assert_eq!(q.options, vec!["A. 1", "B. 2", "C. 3", "D. 4"]);
        assert_eq!(q.student_answer, "B");
    }

    #[test]
    fn stem_starting_with_capital_pair_is_not_an_option() {
        let raw = "5.\nA、B两地相距10千米\n作答：5";
        let q = &parse_text_questions(raw)[0];
        assert!(q.options.is_empty());
        assert_eq!(q.content, "A、B两地相距10千米");
    }

    #[test]
    fn text_overrides_grader_fields_when_non_empty() {
        let graded = vec![QuestionRecord {
            question_number: "1".into(),
            content: "计算一加二".into(),
            student_answer: "3".into(),
            verdict: Verdict::Correct,
            warnings: vec!["可能误读：选项D可能是8".into(), "字迹潦草".into()],
            ..Default::default()
        }];
        let text = vec![TextQuestion {
            question_number: "1".into(),
            content: "计算 1+2=?".into(),
            warnings: vec!["字迹潦草".into(), "可能误读：等号".into()],
            ..Default::default()
        }];

        let (questions, source) = reconcile(graded, text);
        assert_eq!(source, BankSource::Reconciled);
        let q = &questions[0];
        assert_eq!(q.content, "计算 1+2=?");
        // 原文没有作答时保留批改结果
        assert_eq!(q.student_answer, "3");
        assert_eq!(q.verdict, Verdict::Correct);
        assert_eq!(
            q.warnings,
            vec!["可能误读：选项D可能是8", "字迹潦草", "可能误读：等号"]
        );
    }

    #[test]
    fn grading_failure_falls_back_to_text_only() {
        let bank = build_bank("s1", Subject::Math, SAMPLE, Vec::new(), Vec::new());
        assert_eq!(bank.source, BankSource::TextOnly);
        assert_eq!(bank.len(), 3);
        assert!(bank
            .questions
            .iter()
            .all(|q| q.verdict == Verdict::Uncertain && q.reason == GRADING_INCOMPLETE));
    }

    #[test]
    fn no_boundaries_yields_placeholder() {
        let bank = build_bank("s1", Subject::Math, "一段没有题号的文字", Vec::new(), Vec::new());
        assert_eq!(bank.source, BankSource::Placeholder);
        assert_eq!(bank.question_numbers(), vec![PLACEHOLDER_NUMBER]);
    }

    #[test]
    fn text_only_questions_are_appended_as_not_graded() {
        let graded = vec![QuestionRecord {
            question_number: "1".into(),
            verdict: Verdict::Correct,
            ..Default::default()
        }];
        let (questions, _) = reconcile(graded, parse_text_questions(SAMPLE));
        assert_eq!(questions.len(), 3);
        assert_eq!(questions[2].reason, NOT_GRADED);
    }

    #[test]
    fn unnumbered_graded_records_are_all_kept() {
        let unnumbered = |reason: &str| QuestionRecord {
            verdict: Verdict::Incorrect,
            reason: reason.into(),
            ..Default::default()
        };
        let graded = vec![unnumbered("符号错误"), unnumbered("漏写单位")];

        let (questions, _) = reconcile(graded.clone(), Vec::new());
        let numbers: Vec<_> = questions.iter().map(|q| q.question_number.as_str()).collect();
        assert_eq!(numbers, vec!["未编号-1", "未编号-2"]);
        assert!(questions.iter().all(|q| q.warnings.len() == 1));

        // 重复构建得到相同题号
        let (again, _) = reconcile(graded, Vec::new());
        assert_eq!(again, questions);
    }
}
