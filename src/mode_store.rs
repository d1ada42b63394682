//! 讲解模式存储
//!
//! 当前模式的持久化（非法值回退到引导思考），以及"挂起的模式变更"：
//! 模式选择页写入单槽位，结果页下次可见时按记录 ID 匹配消费。
//! 槽位后写覆盖先写，是产品层面接受的取舍（只认最新选择）。

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::local_store::{LocalStore, LocalStoreExt, KEY_ANALYSIS_MODE, KEY_PENDING_MODE_CHANGE};
use crate::models::{AnalysisMode, AppError, PendingModeChange};

/// 模式选择页展示用的选项行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeOption {
    pub mode: AnalysisMode,
    pub label: &'static str,
    pub description: &'static str,
}

pub struct ModeStore {
    store: Arc<dyn LocalStore>,
}

impl ModeStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// 固定的四个选项（顺序即展示顺序）
    pub fn mode_options() -> Vec<ModeOption> {
        AnalysisMode::ALL
            .iter()
            .map(|mode| ModeOption {
                mode: *mode,
                label: mode.label(),
                description: mode.description(),
            })
            .collect()
    }

    /// 当前模式。存储缺失、损坏或取值不在枚举内时一律回退到引导思考。
    pub fn current_mode(&self) -> AnalysisMode {
        match self.store.get_json::<String>(KEY_ANALYSIS_MODE) {
            Ok(Some(raw)) => AnalysisMode::parse(&raw),
            Ok(None) => AnalysisMode::Guided,
            Err(e) => {
                warn!("读取当前模式失败，回退到默认模式: {}", e);
                AnalysisMode::Guided
            }
        }
    }

    /// 写入当前模式。同步落盘，下一次读取立即可见。
    pub fn set_current_mode(&self, mode: AnalysisMode) -> Result<AnalysisMode, AppError> {
        self.store
            .put_json(KEY_ANALYSIS_MODE, &mode.as_str().to_string())?;
        Ok(mode)
    }

    /// 暂存一条模式变更。单槽位，覆盖任何未消费的旧变更。
    pub fn stash_pending_change(
        &self,
        record_id: i64,
        mode: AnalysisMode,
    ) -> Result<(), AppError> {
        let change = PendingModeChange {
            record_id,
            mode,
            requested_at: Utc::now(),
        };
        self.store.put_json(KEY_PENDING_MODE_CHANGE, &change)?;
        debug!("已暂存模式变更: record={} mode={}", record_id, mode);
        Ok(())
    }

    /// 页面可见时调用：槽位记录 ID 匹配则删除并返回，
    /// 属于其他记录的变更原样留在槽位里等它自己的页面。
    pub fn consume_pending_change(
        &self,
        record_id: i64,
    ) -> Result<Option<AnalysisMode>, AppError> {
        let Some(change) = self
            .store
            .get_json::<PendingModeChange>(KEY_PENDING_MODE_CHANGE)?
        else {
            return Ok(None);
        };
        if change.record_id != record_id {
            debug!(
                "挂起的模式变更属于记录 {}，当前页面是 {}，保留槽位",
                change.record_id, record_id
            );
            return Ok(None);
        }
        self.store.remove(KEY_PENDING_MODE_CHANGE)?;
        Ok(Some(change.mode))
    }
}
