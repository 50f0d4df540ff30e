//! 批改服务 - 业务能力层
//!
//! 原文 → 结构化批改结果。
//! - 网络 / 超时类错误对同一服务商指数退避重试
//! - 调用成功但内容不可用（错误签名、拒答、JSON 修复后仍无法解析）不重试，直接走备用服务商
//! - 备用服务商固定（配置项 `grading_fallback`），与主服务商相同时不再尝试

use crate::clients::LlmBackend;
use crate::error::ProviderError;
use crate::infrastructure::{Budget, ProviderPools};
use crate::models::provider::LlmProvider;
use crate::models::question::{AnswerStatus, QuestionRecord, Verdict, WrongItem};
use crate::models::subject::Subject;
use crate::services::json_repair::parse_model_json;
use crate::services::prompts;
use crate::utils::truncate_text;
use phf::phf_set;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 服务商把错误信息当作正文返回时的特征串（小写）
static ERROR_SIGNATURES: phf::Set<&'static str> = phf_set! {
    "invalidendpointormodel",
    "invalid model",
    "model not found",
    "model_not_found",
    "the model does not exist",
    "endpoint not found",
    "404 not found",
    "access denied",
    "quota exceeded",
    "rate limit exceeded",
    "internal server error",
};

/// 拒答开头
const CANNOT_GRADE_PREAMBLES: &[&str] = &[
    "无法批改",
    "抱歉，我无法",
    "抱歉,我无法",
    "很抱歉，我不能",
    "i can't grade",
    "i cannot grade",
    "i'm unable to grade",
    "unable to grade",
];

/// 只检查开头这么多字符，避免把题目原文里的词误判为错误
const SIGNATURE_SCAN_CHARS: usize = 300;

/// 解析后的批改输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraderOutput {
    pub questions: Vec<QuestionRecord>,
    pub wrong_items: Vec<WrongItem>,
    pub summary: Option<String>,
}

/// 批改成功
#[derive(Debug, Clone)]
pub struct GradingOutput {
    pub graded: GraderOutput,
    pub provider_used: LlmProvider,
    pub fallback_used: bool,
    pub warnings: Vec<String>,
}

/// 批改失败（所有服务商都已尝试）
#[derive(Debug, Clone)]
pub struct GradingFailure {
    pub warnings: Vec<String>,
    pub budget_exhausted: bool,
    pub last_error: Option<ProviderError>,
}

enum CallError {
    Budget,
    Provider(ProviderError),
}

/// 批改服务
///
/// 职责：
/// - 调用文本模型批改原文
/// - 解析 / 修复模型输出
/// - 主服务商失败时切换到备用服务商
pub struct GradingService {
    backend: Arc<dyn LlmBackend>,
    pools: ProviderPools,
    fallback: LlmProvider,
    max_attempts: u32,
    base_delay: Duration,
}

impl GradingService {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        pools: ProviderPools,
        fallback: LlmProvider,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            backend,
            pools,
            fallback,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 批改
    ///
    /// # 参数
    /// - `subject`: 学科
    /// - `vision_text`: 识图原文
    /// - `primary`: 主服务商
    /// - `budget`: 请求级时间预算
    /// - `stage_default`: 本阶段默认超时
    pub async fn grade(
        &self,
        subject: Subject,
        vision_text: &str,
        primary: LlmProvider,
        budget: &Budget,
        stage_default: Duration,
    ) -> Result<GradingOutput, GradingFailure> {
        let system_message = prompts::grading_system_message(subject);
        let user_message = prompts::grading_user_message(subject, vision_text);

        let mut chain = vec![primary];
        if self.fallback != primary {
            chain.push(self.fallback);
        }

        let mut warnings = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for (index, provider) in chain.iter().copied().enumerate() {
            let budget_message = if index == 0 {
                "SLA exceeded before stage grading started".to_string()
            } else {
                format!("SLA exceeded before fallback (grading via {})", provider)
            };
            if budget.stage_budget(stage_default).is_none() {
                warn!("⏱ {}", budget_message);
                warnings.push(budget_message);
                return Err(GradingFailure {
                    warnings,
                    budget_exhausted: true,
                    last_error,
                });
            }

            let result = match self
                .call_with_retry(provider, &system_message, &user_message, budget, stage_default)
                .await
            {
                Ok(raw) => interpret_output(&raw),
                Err(CallError::Budget) => {
                    warnings.push(budget_message);
                    return Err(GradingFailure {
                        warnings,
                        budget_exhausted: true,
                        last_error,
                    });
                }
                Err(CallError::Provider(e)) => Err(e),
            };

            match result {
                Ok(graded) => {
                    if let Some(original) = &last_error {
                        warnings.push(format!(
                            "grading fell back to {} after {} failed: {}",
                            provider, primary, original
                        ));
                        info!("✓ 批改经备用服务商 {} 完成", provider);
                    }
                    return Ok(GradingOutput {
                        graded,
                        provider_used: provider,
                        fallback_used: index > 0,
                        warnings,
                    });
                }
                Err(e) => {
                    warn!("批改失败 ({}): {}", provider, e);
                    warnings.push(format!("grading provider {} failed: {}", provider, e));
                    last_error = Some(e);
                }
            }
        }

        Err(GradingFailure {
            warnings,
            budget_exhausted: false,
            last_error,
        })
    }

    /// 单个服务商：瞬时错误指数退避重试，每次重试都受剩余预算约束
    async fn call_with_retry(
        &self,
        provider: LlmProvider,
        system_message: &str,
        user_message: &str,
        budget: &Budget,
        stage_default: Duration,
    ) -> Result<String, CallError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = self
                    .pools
                    .acquire_llm()
                    .await
                    .map_err(|e| CallError::Provider(ProviderError::Transport(e.to_string())))?;
                let Some(timeout) = budget.stage_budget(stage_default) else {
                    return Err(CallError::Budget);
                };
                self.backend
                    .complete(provider, system_message, user_message, timeout)
                    .await
            };

            match outcome {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    if delay >= budget.remaining() {
                        return Err(CallError::Provider(e));
                    }
                    warn!(
                        "批改调用失败 ({}，第 {} 次): {}，{:?} 后重试",
                        provider, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(CallError::Provider(e)),
            }
        }
    }
}

// ========== 输出解析 ==========

/// 检查错误签名并解析
pub fn interpret_output(raw: &str) -> Result<GraderOutput, ProviderError> {
    if let Some(signature) = semantic_failure(raw) {
        return Err(ProviderError::Semantic(signature));
    }
    let value = parse_model_json(raw).ok_or_else(|| {
        debug!("无法解析的批改输出: {}", truncate_text(raw, 200));
        ProviderError::Semantic("unparseable grader output".to_string())
    })?;
    let output = parse_grader_output(&value);
    if output.questions.is_empty() && output.wrong_items.is_empty() {
        return Err(ProviderError::Semantic("grader output has no questions".to_string()));
    }
    Ok(output)
}

/// 错误签名 / 拒答检测，返回命中的特征
pub fn semantic_failure(raw: &str) -> Option<String> {
    let head: String = raw
        .trim()
        .chars()
        .take(SIGNATURE_SCAN_CHARS)
        .collect::<String>()
        .to_lowercase();

    if let Some(preamble) = CANNOT_GRADE_PREAMBLES.iter().find(|p| head.starts_with(*p)) {
        return Some(format!("refusal: {}", preamble));
    }
    ERROR_SIGNATURES
        .iter()
        .find(|sig| head.contains(**sig))
        .map(|sig| format!("error signature: {}", sig))
}

/// 宽松地把 JSON 转成批改输出（字段名、数字/字符串类型都容忍）
pub fn parse_grader_output(value: &Value) -> GraderOutput {
    let (questions, wrong_items, summary) = match value {
        Value::Array(items) => (items.as_slice(), &[][..], None),
        Value::Object(_) => (
            value
                .get("questions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            value
                .get("wrong_items")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            value
                .get("summary")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
        ),
        _ => (&[][..], &[][..], None),
    };

    GraderOutput {
        questions: questions.iter().filter_map(parse_question).collect(),
        wrong_items: wrong_items.iter().filter_map(parse_wrong_item).collect(),
        summary,
    }
}

fn parse_question(value: &Value) -> Option<QuestionRecord> {
    value.as_object()?;
    let verdict = match value.get("verdict") {
        Some(Value::String(s)) => Verdict::parse_loose(s),
        Some(Value::Bool(true)) => Verdict::Correct,
        Some(Value::Bool(false)) => Verdict::Incorrect,
        _ => match value.get("is_correct").and_then(Value::as_bool) {
            Some(true) => Verdict::Correct,
            Some(false) => Verdict::Incorrect,
            None => Verdict::Uncertain,
        },
    };

    Some(QuestionRecord {
        question_number: text_field(value, &["question_number", "number", "id"]),
        content: text_field(value, &["content", "question_content", "stem"]),
        student_answer: text_field(value, &["student_answer", "answer"]),
        options: string_list(value, "options"),
        verdict,
        reason: text_field(value, &["reason", "explanation"]),
        warnings: string_list(value, "warnings"),
        knowledge_tags: string_list(value, "knowledge_tags"),
        answer_status: parse_answer_status(&text_field(value, &["answer_status", "status"])),
        first_wrong_step: first_wrong_step(value),
    })
}

fn parse_wrong_item(value: &Value) -> Option<WrongItem> {
    value.as_object()?;
    Some(WrongItem {
        item_id: String::new(),
        question_number: text_field(value, &["question_number", "number", "id"]),
        reason: text_field(value, &["reason", "explanation"]),
        question_content: text_field(value, &["question_content", "content", "stem"]),
        student_answer: text_field(value, &["student_answer", "answer"]),
        warnings: string_list(value, "warnings"),
        knowledge_tags: string_list(value, "knowledge_tags"),
        first_wrong_step: first_wrong_step(value),
    })
}

/// 第一个不正确的步骤
fn first_wrong_step(value: &Value) -> Option<String> {
    if let Some(step) = value.get("first_wrong_step").and_then(Value::as_str) {
        return Some(step.to_string()).filter(|s| !s.trim().is_empty());
    }
    value
        .get("steps")?
        .as_array()?
        .iter()
        .find(|step| {
            let verdict = match step.get("verdict") {
                Some(Value::String(s)) => Verdict::parse_loose(s),
                Some(Value::Bool(true)) => Verdict::Correct,
                Some(Value::Bool(false)) => Verdict::Incorrect,
                _ => Verdict::Uncertain,
            };
            verdict != Verdict::Correct
        })
        .map(|step| {
            let content = text_field(step, &["content", "text"]);
            match step.get("index").map(value_to_string) {
                Some(index) if !index.is_empty() => format!("步骤{}: {}", index, content),
                _ => content,
            }
        })
}

fn parse_answer_status(raw: &str) -> AnswerStatus {
    match raw.trim().to_lowercase().as_str() {
        "answered" | "已作答" => AnswerStatus::Answered,
        "blank" | "未作答" | "empty" => AnswerStatus::Blank,
        _ => AnswerStatus::Uncertain,
    }
}

fn text_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .map(value_to_string)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::TokenStream;
    use crate::models::ChatMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// 按调用顺序返回预设结果
    struct ScriptedLlm {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: Mutex<Vec<LlmProvider>>,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn complete(
            &self,
            provider: LlmProvider,
            _system_message: &str,
            _user_message: &str,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.calls.lock().push(provider);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Api("script exhausted".into())))
        }

        async fn stream(
            &self,
            _provider: LlmProvider,
            _messages: &[ChatMessage],
        ) -> Result<TokenStream, ProviderError> {
            Err(ProviderError::Api("not used".into()))
        }
    }

    const GOOD: &str = r#"{"questions": [
        {"question_number": 1, "verdict": "correct", "content": "1+1"},
        {"question_number": "2", "verdict": "incorrect", "reason": "计算错误",
         "steps": [{"index": 1, "content": "2×3=6", "verdict": "correct"},
                   {"index": 2, "content": "6+1=8", "verdict": "incorrect"}]}
    ], "summary": "整体不错"}"#;

    fn service(llm: Arc<ScriptedLlm>) -> GradingService {
        GradingService::new(
            llm,
            ProviderPools::new(2, 2),
            LlmProvider::Qwen,
            2,
            Duration::from_millis(500),
        )
    }

    #[test]
    fn lenient_parsing_keeps_first_wrong_step_only() {
        let output = interpret_output(GOOD).unwrap();
        assert_eq!(output.questions.len(), 2);
        assert_eq!(output.questions[0].question_number, "1");
        assert_eq!(
            output.questions[1].first_wrong_step.as_deref(),
            Some("步骤2: 6+1=8")
        );
        assert_eq!(output.summary.as_deref(), Some("整体不错"));
    }

    #[test]
    fn error_signatures_and_refusals_are_semantic_failures() {
        assert!(matches!(
            interpret_output("Error: InvalidEndpointOrModel.NotFound"),
            Err(ProviderError::Semantic(_))
        ));
        assert!(matches!(
            interpret_output("抱歉，我无法批改这张图片"),
            Err(ProviderError::Semantic(_))
        ));
        assert!(matches!(
            interpret_output(r#"{"questions": []}"#),
            Err(ProviderError::Semantic(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_backoff() {
        let llm = ScriptedLlm::new(vec![Err(ProviderError::Timeout(100)), Ok(GOOD.to_string())]);
        let output = service(llm.clone())
            .grade(
                Subject::Math,
                "text",
                LlmProvider::Doubao,
                &Budget::start(Duration::from_secs(120)),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(*llm.calls.lock(), vec![LlmProvider::Doubao, LlmProvider::Doubao]);
        assert!(!output.fallback_used);
        assert!(output.warnings.is_empty());
    }

    #[tokio::test]
    async fn semantic_failure_goes_straight_to_fallback() {
        let llm = ScriptedLlm::new(vec![
            Ok("model not found".to_string()),
            Ok(GOOD.to_string()),
        ]);
        let output = service(llm.clone())
            .grade(
                Subject::Math,
                "text",
                LlmProvider::Doubao,
                &Budget::start(Duration::from_secs(120)),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(*llm.calls.lock(), vec![LlmProvider::Doubao, LlmProvider::Qwen]);
        assert!(output.fallback_used);
        assert_eq!(output.provider_used, LlmProvider::Qwen);
        assert!(output.warnings[0].contains("grading provider doubao failed"));
        assert!(output.warnings[1].contains("fell back to qwen"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chain_reports_every_attempt_in_order() {
        let llm = ScriptedLlm::new(vec![
            Err(ProviderError::Api("bad request".into())),
            Ok("not json at all".to_string()),
        ]);
        let failure = service(llm)
            .grade(
                Subject::Math,
                "text",
                LlmProvider::Doubao,
                &Budget::start(Duration::from_secs(120)),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        assert!(!failure.budget_exhausted);
        assert_eq!(failure.warnings.len(), 2);
        assert!(failure.warnings[0].contains("doubao"));
        assert!(failure.warnings[1].contains("qwen"));
    }

    #[tokio::test]
    async fn no_fallback_when_primary_is_the_fallback() {
        let llm = ScriptedLlm::new(vec![Ok("model not found".to_string())]);
        let failure = service(llm.clone())
            .grade(
                Subject::Math,
                "text",
                LlmProvider::Qwen,
                &Budget::start(Duration::from_secs(120)),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        assert_eq!(llm.calls.lock().len(), 1);
        assert_eq!(failure.warnings.len(), 1);
    }
}
