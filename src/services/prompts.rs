//! 提示词
//!
//! 识图输出格式与 `question_bank` 的文本文法保持一致，批改输出为固定 JSON 结构。

use crate::models::question::QuestionRecord;
use crate::models::subject::Subject;

/// 图片里没有作业题目时识图模型只输出这个标记
pub const NO_HOMEWORK_MARKER: &str = "[[NO_HOMEWORK]]";

/// 整页识图提示词
pub fn vision_prompt(subject: Subject) -> String {
    format!(
        r#"你是一名细心的{subject}老师助手。请逐题转写图片中的作业内容，不要批改，不要解题。

严格按以下格式输出每一道题：
### 第<题号>题
题目：<完整题干，保留公式、数字、单位；图中的关键信息用文字描述>
A. <选项>（没有选项则省略）
学生作答：<学生写下的答案，没写则填"无">
作答状态：<已作答 / 未作答 / 不确定>
步骤：<学生的解题步骤，逐行转写>

要求：
- 题号照抄原卷，例如 3、15(2)②、28(1)①
- 看不清或可能看错的地方，单独写一行"可能误读：<说明>"
- 不要合并或拆分题目
- 图片里没有任何作业题目时，只输出 {marker}"#,
        subject = subject.name(),
        marker = NO_HOMEWORK_MARKER
    )
}

/// 批改的系统提示词
pub fn grading_system_message(subject: Subject) -> String {
    format!(
        "你是一名严谨的{}老师，负责批改学生作业。只依据给出的识别文本批改，不要臆造题目。\
         只输出 JSON，不要输出任何其他内容。",
        subject.name()
    )
}

/// 批改的用户消息
pub fn grading_user_message(subject: Subject, vision_text: &str) -> String {
    format!(
        r#"以下是{subject}作业的识别文本：

{vision_text}

请逐题批改，输出如下 JSON：
{{
  "questions": [
    {{
      "question_number": "题号（照抄原文）",
      "content": "题干",
      "student_answer": "学生作答",
      "options": ["A. ...", "B. ..."],
      "verdict": "correct | incorrect | uncertain",
      "reason": "判错或不确定的原因（正确时留空）",
      "answer_status": "answered | blank | uncertain",
      "knowledge_tags": ["知识点"],
      "warnings": ["可能误读：..."],
      "steps": [{{"index": 1, "content": "步骤内容", "verdict": "correct | incorrect"}}]
    }}
  ],
  "wrong_items": [
    {{"question_number": "题号", "reason": "原因", "student_answer": "学生作答"}}
  ],
  "summary": "一句话总结"
}}

要求：
- questions 必须包含所有题目，包括做对的
- 无法判断时 verdict 填 uncertain 并写明原因"#,
        subject = subject.name(),
        vision_text = vision_text
    )
}

/// 辅导会话的系统提示词
///
/// # 参数
/// - `subject`: 学科
/// - `focus`: 当前聚焦的题
/// - `corrections`: 学生已确认的更正
pub fn tutor_system_message(subject: Subject, focus: &QuestionRecord, corrections: &[String]) -> String {
    let mut message = format!(
        "你是一名耐心的{}辅导老师，正在和学生讨论作业中的第{}题。\
         用启发式提问引导学生自己发现问题，不要直接给出完整答案。回答简洁。\n\n",
        subject.name(),
        focus.question_number
    );

    message.push_str(&format!("【题目】{}\n", non_empty(&focus.content)));
    if !focus.options.is_empty() {
        message.push_str(&format!("【选项】{}\n", focus.options.join("  ")));
    }
    message.push_str(&format!("【学生作答】{}\n", non_empty(&focus.student_answer)));
    message.push_str(&format!(
        "【批改结果】{:?}，{}\n",
        focus.verdict,
        non_empty(&focus.reason)
    ));
    if let Some(step) = &focus.first_wrong_step {
        message.push_str(&format!("【第一个出错的步骤】{}\n", step));
    }
    if !focus.warnings.is_empty() {
        message.push_str(&format!("【识别提示】{}\n", focus.warnings.join("；")));
    }
    if !corrections.is_empty() {
        message.push_str("\n以下内容已由学生确认，以此为准，不要再争论：\n");
        for correction in corrections {
            message.push_str(&format!("- {}\n", correction));
        }
    }
    message
}

fn non_empty(s: &str) -> &str {
    if s.trim().is_empty() {
        "（无）"
    } else {
        s
    }
}
