/// 日志工具模块
///
/// 提供日志初始化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 初始化日志
///
/// `RUST_LOG` 优先，否则使用配置里的过滤规则。重复调用是安全的（测试里会多次调用）。
///
/// # 参数
/// - `default_filter`: 默认过滤规则，例如 `info` 或 `homework_tutor=debug`
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 已加载的配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 作业批改服务启动");
    info!("🌐 监听地址: {}", config.bind_addr);
    info!(
        "⏱ 批改 SLA: {}s (识图 {}s / 批改 {}s)",
        config.grade_sla_secs, config.vision_timeout_secs, config.grading_timeout_secs
    );
    info!(
        "📊 调用池: 识图 {} / 文本 {}，超过 {} 张图片转异步",
        config.vision_pool_size, config.llm_pool_size, config.max_sync_images
    );
    info!("🔁 批改备用服务商: {}", config.grading_fallback);
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
