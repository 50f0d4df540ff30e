//! 题目聚焦路由
//!
//! 根据用户这一轮的话决定辅导会话绑定到哪道题。
//!
//! 打分 = 题号长度 × 50（越具体越优先）+ 字符位置（越靠后越优先）
//!      + 切换提示词加分（"聊/讲讲/换到…"紧挨在前）− 否定惩罚（"不聊/算了/跳过…"）。
//! 自由文本里紧跟"是/=/得/等于"的数字按作答内容处理，同样扣分。
//! 得分为负的提及视为被否定，直接忽略。

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

const SPECIFICITY_WEIGHT: i64 = 50;
const CUE_BONUS: i64 = 1000;
const NEGATION_PENALTY: i64 = 2000;
const ANSWER_PENALTY: i64 = 2000;
/// 提示词结尾到题号之间最多隔几个字符
const CUE_WINDOW: usize = 8;
const NEGATION_WINDOW: usize = 12;
/// 作答标记与数字之间最多隔几个空白
const ANSWER_WINDOW: usize = 2;

const SWITCH_CUES: &[&str] = &[
    "聊聊", "聊", "讲讲", "讲一下", "说说", "看看", "看一下", "换到", "切换到", "回到", "问问",
    "switch to", "talk about", "what about", "go to", "explain",
];
const NEGATION_BEFORE: &[&str] = &[
    "不聊", "不讲", "不用", "不看", "不要", "别聊", "别讲", "别管", "跳过", "算了", "don't",
    "not ", "skip", "forget",
];
const NEGATION_AFTER: &[&str] = &[
    "不聊", "不讲", "不用", "不看", "不管", "先不", "算了", "跳过", "skip", "never mind",
];
const ANSWER_MARKERS: &[&str] = &["是", "=", "＝", "得", "等于", "答案", "结果", "选", "answer is", "equals"];
const CUE_BLOCKERS: &[char] = &['不', '别', '没'];
const PUNCTUATION: &[char] = &['，', ',', '。', '！', '!', '？', '?', '；', ';', '\n'];

static EXPLICIT_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    let n = r"\d+(?:\(\d+\))*[①-⑳]?";
    Regex::new(&format!(
        r"第\s*(?P<a>{n})\s*(?:小题|题|问)|(?P<b>{n})\s*(?:小题|题)|(?:\bquestion|\bproblem|\bq|#)\s*(?P<c>{n})"
    ))
    .expect("valid regex")
});

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusDecision {
    /// 绑定到题库中的题号
    Bind(String),
    /// 用户点名的题不在题库里
    NotFound {
        requested: String,
        available: Vec<String>,
    },
    /// 没有新的提及，保持当前绑定
    Keep,
    /// 解除绑定，需要用户澄清
    Unbound,
}

#[derive(Debug, Clone)]
struct Mention {
    number: String,
    score: i64,
}

/// 决定本轮聚焦的题号
///
/// # 参数
/// - `message`: 用户本轮输入
/// - `bank_numbers`: 题库中的题号（按出现顺序）
/// - `current`: 当前绑定的题号
pub fn route_focus(message: &str, bank_numbers: &[String], current: Option<&str>) -> FocusDecision {
    let text = normalize_message(message);
    let chars: Vec<char> = text.chars().collect();

    let explicit: Vec<Mention> = EXPLICIT_MENTION
        .captures_iter(&text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps
                .name("a")
                .or_else(|| caps.name("b"))
                .or_else(|| caps.name("c"))?;
            let start = char_offset(&text, whole.start());
            let end = char_offset(&text, whole.end());
            Some(score_mention(&chars, number.as_str(), start, end))
        })
        .collect();

    if !explicit.is_empty() {
        return decide_explicit(explicit, bank_numbers, current);
    }

    // 没有显式"第N题"：在原文中找题库里的题号
    let best = bank_numbers
        .iter()
        .flat_map(|number| find_occurrences(&chars, number))
        .filter(|m| m.score >= 0)
        .max_by_key(|m| m.score);

    match (best, current) {
        (Some(m), _) => {
            debug!("自由文本命中题号 {} (得分 {})", m.number, m.score);
            FocusDecision::Bind(m.number)
        }
        (None, Some(_)) => FocusDecision::Keep,
        (None, None) => FocusDecision::Unbound,
    }
}

fn decide_explicit(
    mentions: Vec<Mention>,
    bank_numbers: &[String],
    current: Option<&str>,
) -> FocusDecision {
    let best = mentions
        .iter()
        .filter(|m| m.score >= 0)
        .max_by_key(|m| m.score);

    match best {
        Some(m) => match resolve_number(&m.number, bank_numbers) {
            Some(resolved) => {
                debug!("显式提及 {} → {} (得分 {})", m.number, resolved, m.score);
                FocusDecision::Bind(resolved)
            }
            None => FocusDecision::NotFound {
                requested: m.number.clone(),
                available: bank_numbers.to_vec(),
            },
        },
        None => {
            // 全部被否定；否定的正好是当前题时解除绑定
            let negates_current = current.is_some_and(|cur| {
                mentions
                    .iter()
                    .any(|m| resolve_number(&m.number, bank_numbers).as_deref() == Some(cur))
            });
            if negates_current {
                FocusDecision::Unbound
            } else if current.is_some() {
                FocusDecision::Keep
            } else {
                FocusDecision::Unbound
            }
        }
    }
}

/// 题号解析：精确匹配 → 前缀匹配（"28" → "28(1)①"）
pub fn resolve_number(requested: &str, bank_numbers: &[String]) -> Option<String> {
    if let Some(exact) = bank_numbers.iter().find(|n| n.as_str() == requested) {
        return Some(exact.clone());
    }
    bank_numbers
        .iter()
        .find(|n| {
            n.strip_prefix(requested)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| !c.is_ascii_digit())
        })
        .cloned()
}

/// 找不到题时给用户的提示
pub fn not_found_message(requested: &str, available: &[String]) -> String {
    format!(
        "没有找到第{}题。本次批改中的题号有：{}。请告诉我想聊哪一道。",
        requested,
        available.join("、")
    )
}

/// 未绑定时的澄清提示
pub fn clarify_message(available: &[String]) -> String {
    format!(
        "想聊哪一道题呢？可以说\"讲讲第{}题\"。本次批改中的题号有：{}。",
        available.first().map(String::as_str).unwrap_or("1"),
        available.join("、")
    )
}

// ========== 辅助函数 ==========

/// 全角数字/括号转半角、ASCII 小写；逐字符一一对应，字符下标不变
fn normalize_message(message: &str) -> String {
    message
        .chars()
        .map(|c| match c {
            '（' => '(',
            '）' => ')',
            '＃' => '#',
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn char_offset(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset].chars().count()
}

/// 题号在文本中的出现位置（前后都不能紧挨数字）
fn find_occurrences(chars: &[char], number: &str) -> Vec<Mention> {
    let needle: Vec<char> = number.chars().collect();
    if needle.is_empty() || needle.len() > chars.len() {
        return Vec::new();
    }
    (0..=chars.len() - needle.len())
        .filter(|&start| chars[start..start + needle.len()] == needle[..])
        .filter(|&start| start == 0 || !chars[start - 1].is_ascii_digit())
        .filter(|&start| {
            chars
                .get(start + needle.len())
                .map_or(true, |c| !c.is_ascii_digit())
        })
        .map(|start| {
            let mut mention = score_mention(chars, number, start, start + needle.len());
            if follows_answer_marker(chars, start) {
                mention.score -= ANSWER_PENALTY;
            }
            mention
        })
        .collect()
}

fn score_mention(chars: &[char], number: &str, start: usize, end: usize) -> Mention {
    let has_cue = has_switch_cue_before(chars, start);
    let negated = is_negated_before(chars, start) || is_negated_after(chars, end);

    let mut score = number.chars().count() as i64 * SPECIFICITY_WEIGHT + start as i64;
    if has_cue {
        score += CUE_BONUS;
    }
    if negated {
        score -= NEGATION_PENALTY;
    }

    Mention {
        number: number.to_string(),
        score,
    }
}

/// 在 `chars` 中找 `cue` 的所有结束位置
fn cue_ends(chars: &[char], cue: &str, from: usize, to: usize) -> Vec<usize> {
    let cue: Vec<char> = cue.chars().collect();
    (from.max(cue.len())..=to.min(chars.len()))
        .filter(|&end| chars[end - cue.len()..end] == cue[..])
        .collect()
}

fn contains_punctuation(chars: &[char]) -> bool {
    chars.iter().any(|c| PUNCTUATION.contains(c))
}

fn has_switch_cue_before(chars: &[char], start: usize) -> bool {
    find_switch_cue(chars, start.saturating_sub(CUE_WINDOW), start, start)
}

/// `[from, to]` 内结束、且到 `limit` 之间没有标点的有效切换提示词
fn find_switch_cue(chars: &[char], from: usize, to: usize, limit: usize) -> bool {
    SWITCH_CUES.iter().any(|cue| {
        let cue_len = cue.chars().count();
        cue_ends(chars, cue, from, to).into_iter().any(|end| {
            let cue_start = end - cue_len;
            let blocked = cue_start > 0 && CUE_BLOCKERS.contains(&chars[cue_start - 1]);
            !blocked && !contains_punctuation(&chars[end..limit])
        })
    })
}

/// "我算出来是3"：数字前面紧挨作答标记
fn follows_answer_marker(chars: &[char], start: usize) -> bool {
    let from = start.saturating_sub(ANSWER_WINDOW);
    ANSWER_MARKERS.iter().any(|marker| {
        cue_ends(chars, marker, from, start)
            .into_iter()
            .any(|end| chars[end..start].iter().all(|c| c.is_whitespace()))
    })
}

fn is_negated_before(chars: &[char], start: usize) -> bool {
    let from = start.saturating_sub(NEGATION_WINDOW);
    NEGATION_BEFORE.iter().any(|cue| {
        cue_ends(chars, cue, from, start).into_iter().any(|end| {
            let between = &chars[end..start];
            !contains_punctuation(between) && !find_switch_cue(chars, end, start, start)
        })
    })
}

fn is_negated_after(chars: &[char], end: usize) -> bool {
    let limit = (end + NEGATION_WINDOW).min(chars.len());
    let window = &chars[end..limit];
    let clause_end = window
        .iter()
        .position(|c| PUNCTUATION.contains(c))
        .unwrap_or(window.len());
    let clause: String = window[..clause_end].iter().collect();
    NEGATION_AFTER.iter().any(|cue| clause.contains(cue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(numbers: &[&str]) -> Vec<String> {
        numbers.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn explicit_mention_prefers_prefix_match() {
        let decision = route_focus("讲讲第28题", &bank(&["1", "28(1)①"]), None);
        assert_eq!(decision, FocusDecision::Bind("28(1)①".into()));
    }

    #[test]
    fn negated_mention_loses_to_later_one() {
        let decision = route_focus("不聊25题了，聊28题", &bank(&["25", "28"]), Some("25"));
        assert_eq!(decision, FocusDecision::Bind("28".into()));
    }

    #[test]
    fn negation_after_mention() {
        let decision = route_focus("25题算了，28题怎么做", &bank(&["25", "28"]), None);
        assert_eq!(decision, FocusDecision::Bind("28".into()));
    }

    #[test]
    fn missing_question_is_reported_not_kept() {
        let decision = route_focus("第9题呢", &bank(&["1", "2"]), Some("1"));
        assert_eq!(
            decision,
            FocusDecision::NotFound {
                requested: "9".into(),
                available: bank(&["1", "2"]),
            }
        );
    }

    #[test]
    fn no_mention_keeps_current_or_stays_unbound() {
        let numbers = bank(&["1", "2"]);
        assert_eq!(route_focus("为什么不对？", &numbers, Some("2")), FocusDecision::Keep);
        assert_eq!(route_focus("为什么不对？", &numbers, None), FocusDecision::Unbound);
    }

    #[test]
    fn bare_mention_switches_a_bound_session() {
        let numbers = bank(&["3", "12"]);
        assert_eq!(route_focus("那3呢", &numbers, Some("12")), FocusDecision::Bind("3".into()));
        assert_eq!(route_focus("12 怎么做", &numbers, None), FocusDecision::Bind("12".into()));
        assert_eq!(route_focus("换到 3 吧", &numbers, Some("12")), FocusDecision::Bind("3".into()));
    }

    #[test]
    fn answer_values_do_not_move_focus() {
        let numbers = bank(&["3", "12"]);
        assert_eq!(route_focus("我算出来是3", &numbers, Some("12")), FocusDecision::Keep);
        assert_eq!(route_focus("x = 3 对吗", &numbers, Some("12")), FocusDecision::Keep);
        assert_eq!(route_focus("结果等于 12", &numbers, None), FocusDecision::Unbound);
    }

    #[test]
    fn digit_boundaries_are_respected() {
        let numbers = bank(&["2"]);
        assert_eq!(route_focus("12 怎么做", &numbers, None), FocusDecision::Unbound);
    }

    #[test]
    fn negating_the_current_question_unbinds() {
        let decision = route_focus("第3题不聊了", &bank(&["3", "4"]), Some("3"));
        assert_eq!(decision, FocusDecision::Unbound);
    }

    #[test]
    fn english_and_fullwidth_mentions() {
        let numbers = bank(&["5", "15(2)②"]);
        assert_eq!(
            route_focus("Let's talk about question 5", &numbers, None),
            FocusDecision::Bind("5".into())
        );
        assert_eq!(
            route_focus("讲讲第１５（２）题", &numbers, None),
            FocusDecision::Bind("15(2)②".into())
        );
    }

    #[test]
    fn resolve_prefers_exact_over_prefix() {
        let numbers = bank(&["28(1)①", "28"]);
        assert_eq!(resolve_number("28", &numbers), Some("28".into()));
        assert_eq!(resolve_number("2", &numbers), None);
    }
}
