//! 外部调用池 - 基础设施层
//!
//! 识图与文本模型各一个固定大小的池，所有在途请求共享。
//! 获取槽位本身就是挂起点：没有空位时调用方只等待，不占用其他资源。

use crate::error::{AppError, AppResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Clone)]
pub struct ProviderPools {
    vision: Arc<Semaphore>,
    llm: Arc<Semaphore>,
}

impl ProviderPools {
    pub fn new(vision_size: usize, llm_size: usize) -> Self {
        Self {
            vision: Arc::new(Semaphore::new(vision_size.max(1))),
            llm: Arc::new(Semaphore::new(llm_size.max(1))),
        }
    }

    /// 获取识图槽位，permit 释放即归还
    pub async fn acquire_vision(&self) -> AppResult<OwnedSemaphorePermit> {
        debug!("等待识图槽位 (空闲 {})", self.vision.available_permits());
        self.vision
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Other(format!("识图调用池已关闭: {}", e)))
    }

    /// 获取文本模型槽位
    pub async fn acquire_llm(&self) -> AppResult<OwnedSemaphorePermit> {
        debug!("等待文本模型槽位 (空闲 {})", self.llm.available_permits());
        self.llm
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Other(format!("文本模型调用池已关闭: {}", e)))
    }

    pub fn vision_available(&self) -> usize {
        self.vision.available_permits()
    }

    pub fn llm_available(&self) -> usize {
        self.llm.available_permits()
    }
}
