//! 模型输出 JSON 修复
//!
//! 批改模型偶尔输出被截断或格式不严的 JSON。解析失败时按顺序尝试：
//! 去掉代码围栏 → 转义字符串内的控制字符 → 补逗号 → 删尾逗号 → 补齐括号 → 若干收尾后缀。

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static MISSING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([}\]"]|\d|true|false|null)(\s*\n\s*)(["{\[])"#).expect("valid regex")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#",(\s*[}\]])"#).expect("valid regex"));

const CLOSING_SUFFIXES: &[&str] = &["", "}", "]}", "\"}", "\"]}", "}]}", "\"}]}", "]}]}"];

/// 解析模型输出；必要时修复。全部失败返回 `None`
pub fn parse_model_json(raw: &str) -> Option<Value> {
    let body = extract_json_body(raw)?;
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return Some(value);
    }
    repair_json(body)
}

/// 截取第一个 `{` / `[` 开始的主体，去掉 ```json 围栏
pub fn extract_json_body(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.trim().strip_suffix("```").unwrap_or(trimmed).trim();

    let start = trimmed.find(['{', '['])?;
    let body = &trimmed[start..];
    // 完整对象后面跟着解释文字时截掉
    match body.rfind(['}', ']']) {
        Some(end) if serde_json::from_str::<Value>(&body[..=end]).is_ok() => Some(&body[..=end]),
        _ => Some(body),
    }
}

/// 尽力修复；成功返回解析后的值
pub fn repair_json(body: &str) -> Option<Value> {
    let escaped = escape_control_chars(body);
    let with_commas = MISSING_COMMA.replace_all(&escaped, "$1,$2$3").into_owned();
    let cleaned = TRAILING_COMMA.replace_all(&with_commas, "$1").into_owned();

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }

    let balanced = balance_brackets(&cleaned);
    if let Ok(value) = serde_json::from_str::<Value>(&balanced) {
        return Some(value);
    }

    let base = cleaned.trim_end().trim_end_matches(',');
    CLOSING_SUFFIXES
        .iter()
        .find_map(|suffix| serde_json::from_str::<Value>(&format!("{}{}", base, suffix)).ok())
}

/// 字符串内部的裸换行、制表符等转义
fn escape_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// 补齐未闭合的字符串与括号
fn balance_brackets(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end_matches([',', ':', ' ']).len();
    out.truncate(trimmed_len);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
