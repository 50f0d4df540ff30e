//! 错题规范化
//!
//! 批改模型既会给出完整题目列表，也会给出一份"错题"列表，两者经常不一致。
//! 这里统一成一个确定性的错题列表：同样的输入总是得到同样的 `item_id`，
//! 并且 `normalize(normalize(x)) == normalize(x)`。

use crate::models::question::{normalize_question_number, QuestionRecord, Verdict, WrongItem};
use std::collections::{HashMap, HashSet};

/// 生成最终错题列表
///
/// # 参数
/// - `questions`: 批改模型给出的完整题目列表（可能为空）
/// - `direct`: 批改模型直接给出的错题列表
///
/// # 返回
/// 有完整题目列表时从中推导；否则仅在每一项都带有原因时采用直接列表
pub fn canonicalize(questions: &[QuestionRecord], direct: Vec<WrongItem>) -> Vec<WrongItem> {
    if !questions.is_empty() {
        return normalize(derive_from_questions(questions));
    }
    if !direct.is_empty() && direct.iter().all(|item| !item.reason.trim().is_empty()) {
        return normalize(direct);
    }
    Vec::new()
}

/// 从题目列表推导错题：判定不是 correct 的都算，只保留第一个错误步骤
pub fn derive_from_questions(questions: &[QuestionRecord]) -> Vec<WrongItem> {
    questions
        .iter()
        .filter(|q| q.verdict != Verdict::Correct)
        .map(|q| WrongItem {
            item_id: String::new(),
            question_number: q.question_number.clone(),
            reason: q.reason.clone(),
            question_content: q.content.clone(),
            student_answer: q.student_answer.clone(),
            warnings: q.warnings.clone(),
            knowledge_tags: q.knowledge_tags.clone(),
            first_wrong_step: q.first_wrong_step.clone(),
        })
        .collect()
}

/// 去重并重新生成 `item_id`
///
/// 去重键为（题号, 原因, 学生作答）。`item_id` 总是重新计算：`q:<题号>`，
/// 同题号第二次出现为 `q:<题号>#2`，依此类推；无题号的记为 `q:?`。
pub fn normalize(items: Vec<WrongItem>) -> Vec<WrongItem> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut id_counts: HashMap<String, usize> = HashMap::new();
    let mut result = Vec::with_capacity(items.len());

    for mut item in items {
        item.question_number = normalize_question_number(&item.question_number);
        item.reason = item.reason.trim().to_string();
        item.student_answer = item.student_answer.trim().to_string();

        let key = (
            item.question_number.clone(),
            item.reason.clone(),
            item.student_answer.clone(),
        );
        if !seen.insert(key) {
            continue;
        }

        let base = if item.question_number.is_empty() {
            "q:?".to_string()
        } else {
            format!("q:{}", item.question_number)
        };
        let count = id_counts.entry(base.clone()).or_insert(0);
        *count += 1;
        item.item_id = if *count == 1 {
            base
        } else {
            format!("{}#{}", base, count)
        };

        result.push(item);
    }

    result
}
