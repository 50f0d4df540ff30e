//! 程序配置
//!
//! 加载顺序：`Default` → TOML 文件（可选）→ 环境变量覆盖

use crate::error::{AppError, AppResult};
use crate::models::provider::LlmProvider;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 批改调用重试次数上限（退避按 2 的幂增长）
pub const MAX_GRADING_ATTEMPTS: u32 = 8;

/// 单个模型服务商的接入配置（OpenAI 兼容接口）
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoint {
    pub api_base_url: String,
    pub api_key: String,
    /// 识图模型
    pub vision_model: String,
    /// 文本推理模型
    pub llm_model: String,
}

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP 监听地址
    pub bind_addr: String,
    /// 日志过滤规则（RUST_LOG 优先）
    pub log_filter: String,
    // --- 时间预算 ---
    /// 整个批改请求的 SLA（秒）
    pub grade_sla_secs: u64,
    /// 识图阶段默认超时（秒）
    pub vision_timeout_secs: u64,
    /// 批改阶段默认超时（秒）
    pub grading_timeout_secs: u64,
    /// 辅导会话中"重新识图"的超时（秒）
    pub relook_timeout_secs: u64,
    // --- 并发 ---
    /// 识图调用池大小
    pub vision_pool_size: usize,
    /// 文本模型调用池大小
    pub llm_pool_size: usize,
    /// 超过该图片数量的请求转为异步任务
    pub max_sync_images: usize,
    // --- 重试 ---
    pub grading_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    // --- 存储 TTL ---
    pub idempotency_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub job_ttl_secs: u64,
    // --- 模型服务商 ---
    pub doubao: ProviderEndpoint,
    pub qwen: ProviderEndpoint,
    /// 批改失败时的固定备用服务商
    pub grading_fallback: LlmProvider,
    // --- 辅导会话 ---
    /// 辅导对话使用的服务商
    pub tutor_provider: LlmProvider,
    /// 流式推送的最小间隔（毫秒）
    pub chat_throttle_ms: u64,
    /// 等待模型时的心跳间隔（秒）
    pub heartbeat_secs: u64,
    /// 批改快照（JSON Lines）输出文件
    pub snapshot_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            log_filter: "info".to_string(),
            grade_sla_secs: 120,
            vision_timeout_secs: 60,
            grading_timeout_secs: 60,
            relook_timeout_secs: 20,
            vision_pool_size: 4,
            llm_pool_size: 8,
            max_sync_images: 4,
            grading_max_attempts: 2,
            retry_base_delay_ms: 500,
            idempotency_ttl_secs: 600,
            session_ttl_secs: 24 * 3600,
            job_ttl_secs: 3600,
            doubao: ProviderEndpoint {
                api_base_url: "https://ark.cn-beijing.volces.com/api/v3".to_string(),
                api_key: String::new(),
                vision_model: "doubao-seed-1-6-vision".to_string(),
                llm_model: "doubao-seed-1-6".to_string(),
            },
            qwen: ProviderEndpoint {
                api_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                api_key: String::new(),
                vision_model: "qwen-vl-max".to_string(),
                llm_model: "qwen-max".to_string(),
            },
            grading_fallback: LlmProvider::Qwen,
            tutor_provider: LlmProvider::Doubao,
            chat_throttle_ms: 400,
            heartbeat_secs: 5,
            snapshot_file: "grade_snapshots.jsonl".to_string(),
        }
    }
}

impl Config {
    /// 加载配置：`GRADER_CONFIG` 指向的 TOML（默认 grader.toml，不存在则用默认值），再叠加环境变量
    pub fn load() -> AppResult<Self> {
        let path = std::env::var("GRADER_CONFIG").unwrap_or_else(|_| "grader.toml".to_string());
        let base = if Path::new(&path).exists() {
            Self::from_toml_file(&path)?
        } else {
            Self::default()
        };
        Ok(base.with_env())
    }

    /// 从 TOML 文件读取
    pub fn from_toml_file(path: &str) -> AppResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AppError::config(path, e.to_string()))?;
        Self::from_toml_str(&content).map_err(|e| AppError::config(path, e.to_string()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Self>(content).map(Self::clamped)
    }

    /// 仅使用默认值 + 环境变量
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    fn with_env(self) -> Self {
        let c = self;
        Self {
            bind_addr: env_or("BIND_ADDR", c.bind_addr),
            log_filter: env_or("LOG_FILTER", c.log_filter),
            grade_sla_secs: env_parse("GRADE_SLA_SECS", c.grade_sla_secs),
            vision_timeout_secs: env_parse("VISION_TIMEOUT_SECS", c.vision_timeout_secs),
            grading_timeout_secs: env_parse("GRADING_TIMEOUT_SECS", c.grading_timeout_secs),
            relook_timeout_secs: env_parse("RELOOK_TIMEOUT_SECS", c.relook_timeout_secs),
            vision_pool_size: env_parse("VISION_POOL_SIZE", c.vision_pool_size),
            llm_pool_size: env_parse("LLM_POOL_SIZE", c.llm_pool_size),
            max_sync_images: env_parse("MAX_SYNC_IMAGES", c.max_sync_images),
            grading_max_attempts: env_parse("GRADING_MAX_ATTEMPTS", c.grading_max_attempts),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", c.retry_base_delay_ms),
            idempotency_ttl_secs: env_parse("IDEMPOTENCY_TTL_SECS", c.idempotency_ttl_secs),
            session_ttl_secs: env_parse("SESSION_TTL_SECS", c.session_ttl_secs),
            job_ttl_secs: env_parse("JOB_TTL_SECS", c.job_ttl_secs),
            doubao: endpoint_from_env("DOUBAO", c.doubao),
            qwen: endpoint_from_env("QWEN", c.qwen),
            grading_fallback: std::env::var("GRADING_FALLBACK")
                .ok()
                .and_then(|v| LlmProvider::parse(&v))
                .unwrap_or(c.grading_fallback),
            tutor_provider: std::env::var("TUTOR_PROVIDER")
                .ok()
                .and_then(|v| LlmProvider::parse(&v))
                .unwrap_or(c.tutor_provider),
            chat_throttle_ms: env_parse("CHAT_THROTTLE_MS", c.chat_throttle_ms),
            heartbeat_secs: env_parse("HEARTBEAT_SECS", c.heartbeat_secs),
            snapshot_file: env_or("SNAPSHOT_FILE", c.snapshot_file),
        }
        .clamped()
    }

    /// 把会导致 panic 或死锁的取值收回到可用范围
    fn clamped(mut self) -> Self {
        self.grading_max_attempts = self.grading_max_attempts.clamp(1, MAX_GRADING_ATTEMPTS);
        self.heartbeat_secs = self.heartbeat_secs.max(1);
        self.vision_pool_size = self.vision_pool_size.max(1);
        self.llm_pool_size = self.llm_pool_size.max(1);
        self
    }

    pub fn grade_sla(&self) -> Duration {
        Duration::from_secs(self.grade_sla_secs)
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }

    pub fn grading_timeout(&self) -> Duration {
        Duration::from_secs(self.grading_timeout_secs)
    }

    pub fn relook_timeout(&self) -> Duration {
        Duration::from_secs(self.relook_timeout_secs)
    }

    pub fn chat_throttle(&self) -> Duration {
        Duration::from_millis(self.chat_throttle_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn endpoint(&self, provider: LlmProvider) -> &ProviderEndpoint {
        match provider {
            LlmProvider::Doubao => &self.doubao,
            LlmProvider::Qwen => &self.qwen,
        }
    }
}

fn env_or(name: &str, current: String) -> String {
    std::env::var(name).unwrap_or(current)
}

fn env_parse<T: std::str::FromStr>(name: &str, current: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

fn endpoint_from_env(prefix: &str, current: ProviderEndpoint) -> ProviderEndpoint {
    ProviderEndpoint {
        api_base_url: env_or(&format!("{prefix}_API_BASE_URL"), current.api_base_url),
        api_key: env_or(&format!("{prefix}_API_KEY"), current.api_key),
        vision_model: env_or(&format!("{prefix}_VISION_MODEL"), current.vision_model),
        llm_model: env_or(&format!("{prefix}_LLM_MODEL"), current.llm_model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_named_keys() {
        let config = Config::from_toml_str(
            r#"
            grade_sla_secs = 30
            grading_fallback = "doubao"

            [qwen]
            api_key = "sk-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.grade_sla_secs, 30);
        assert_eq!(config.grading_fallback, LlmProvider::Doubao);
        assert_eq!(config.qwen.api_key, "sk-test");
        // 未出现的段落保持默认
        assert_eq!(config.doubao.vision_model, "doubao-seed-1-6-vision");
        assert_eq!(config.vision_pool_size, 4);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = Config::from_toml_str(
            r#"
            grading_max_attempts = 40
            heartbeat_secs = 0
            vision_pool_size = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.grading_max_attempts, MAX_GRADING_ATTEMPTS);
        assert_eq!(config.heartbeat_secs, 1);
        assert_eq!(config.vision_pool_size, 1);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn endpoint_lookup_follows_provider() {
        let config = Config::default();
        assert_eq!(config.endpoint(LlmProvider::Doubao).llm_model, "doubao-seed-1-6");
        assert_eq!(config.endpoint(LlmProvider::Qwen).llm_model, "qwen-max");
    }
}
