//! 时间预算 - 基础设施层
//!
//! 请求入口处启动单调时钟，之后每个阶段从剩余时间里领取自己的子预算，
//! 保证整个请求遵守同一个 SLA 截止时间。

use std::time::Duration;
use tokio::time::Instant;

/// 请求级时间预算
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    deadline: Instant,
}

impl Budget {
    /// 以当前时刻为起点、`sla` 为总时长开启预算
    pub fn start(sla: Duration) -> Self {
        Self {
            deadline: Instant::now() + sla,
        }
    }

    /// `max(0, deadline − now)`
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 阶段子预算：`min(stage_default, remaining())`，剩余为 0 时返回 `None`
    pub fn stage_budget(&self, stage_default: Duration) -> Option<Duration> {
        let allowance = stage_default.min(self.remaining());
        if allowance.is_zero() {
            None
        } else {
            Some(allowance)
        }
    }
}

/// 阶段计时器，用于填充响应里的 timings
#[derive(Debug)]
pub struct StageTimer {
    started: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
