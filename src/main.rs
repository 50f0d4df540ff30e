use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homework_tutor::utils::logging;
use homework_tutor::{router, AppState, Config};
use tracing::{debug, info};

/// 过期条目清理间隔
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load()?;

    // 初始化日志
    logging::init(&config.log_filter);
    logging::log_startup(&config);

    let bind_addr = config.bind_addr.clone();
    let (state, store) = AppState::from_config(config);

    // 定期清理过期的题库 / 会话 / 任务
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!("清理过期条目 {} 条", purged);
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("无法监听 {}", bind_addr))?;
    info!("✓ 服务已启动: {}", bind_addr);

    axum::serve(listener, router(Arc::new(state)))
        .await
        .context("HTTP 服务异常退出")?;

    Ok(())
}
