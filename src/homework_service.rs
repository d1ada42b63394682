//! 作业分析工作流
//!
//! 驱动 拍照提交 → 单次分析 → 展示 → 重新生成 的完整链路，
//! 以及历史列表的展示归一化。页面控制器持有提交状态机与
//! 导航代际（epoch），保证：同屏并发提交被忽略、
//! 离开页面后迟到的响应被丢弃、失败时上一份记录原样保留。

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use reqwest::Method;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api_client::ApiClient;
use crate::mode_store::ModeStore;
use crate::models::{AnalysisMode, AppError, HomeworkRecord, RecordSummary};

pub struct HomeworkService {
    api: Arc<ApiClient>,
    modes: Arc<ModeStore>,
}

impl HomeworkService {
    pub fn new(api: Arc<ApiClient>, modes: Arc<ModeStore>) -> Self {
        Self { api, modes }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn modes(&self) -> &Arc<ModeStore> {
        &self.modes
    }

    // ==================== 后端操作 ====================

    /// 上传作业图片做一次分析。空路径是本地校验错误，不碰网络。
    /// 选定的模式随上传一并持久化为当前模式。
    pub async fn upload_homework(
        &self,
        image_path: &str,
        mode: AnalysisMode,
    ) -> Result<HomeworkRecord, AppError> {
        if image_path.trim().is_empty() {
            return Err(AppError::validation("未选择图片"));
        }
        let mode = self.modes.set_current_mode(mode)?;

        let payload = self
            .api
            .upload_file(
                "/api/v1/homework/analyze",
                Path::new(image_path),
                "image",
                &[("mode", mode.as_str().to_string())],
                true,
            )
            .await?;

        let record = parse_record(payload.get("record"))?
            .ok_or_else(|| AppError::protocol("后端未返回记录ID"))?;
        if record.id <= 0 {
            return Err(AppError::protocol("后端未返回记录ID"));
        }
        info!("作业分析完成: record={} mode={}", record.id, mode);
        Ok(record)
    }

    /// 按 ID 拉取记录详情。后端明确返回 record: null 时是
    /// NotFound，和一般失败区分开。
    pub async fn fetch_detail(&self, record_id: i64) -> Result<HomeworkRecord, AppError> {
        let payload = self
            .api
            .call(
                &format!("/api/v1/history/{}", record_id),
                Method::GET,
                None,
                true,
            )
            .await?;
        parse_record(payload.get("record"))?
            .ok_or_else(|| AppError::not_found("记录不存在"))
    }

    /// 用新模式重跑某条记录的分析，成功后由调用方整体替换旧记录。
    /// 选定的模式同样持久化为当前模式。
    pub async fn regenerate(
        &self,
        record_id: i64,
        mode: AnalysisMode,
    ) -> Result<HomeworkRecord, AppError> {
        let mode = self.modes.set_current_mode(mode)?;
        let payload = self
            .api
            .call(
                &format!(
                    "/api/v1/homework/{}/regenerate?mode={}",
                    record_id,
                    mode.as_str()
                ),
                Method::POST,
                Some(serde_json::json!({ "mode": mode.as_str() })),
                true,
            )
            .await?;
        parse_record(payload.get("record"))?
            .ok_or_else(|| AppError::protocol("后端未返回讲解记录"))
    }

    /// 历史列表，保持服务端顺序
    pub async fn fetch_history(&self) -> Result<Vec<RecordSummary>, AppError> {
        let payload = self
            .api
            .call("/api/v1/history", Method::GET, None, true)
            .await?;
        let items = payload
            .get("items")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        Ok(serde_json::from_value(items).unwrap_or_default())
    }

    /// 拉取历史并按当前时间做展示归一化
    pub async fn fetch_history_entries(&self) -> Result<Vec<HistoryEntry>, AppError> {
        let items = self.fetch_history().await?;
        Ok(self.history_entries(&items, Local::now().naive_local()))
    }

    // ==================== 展示归一化 ====================

    /// 详情记录 → 展示字段。资源地址在这里解析，板块在这里渲染，
    /// 出去的每个字段都可直接上屏。
    pub fn record_view(&self, record: &HomeworkRecord) -> RecordView {
        RecordView {
            id: record.id,
            title: display_title(&record.title, &record.question_text),
            grade: display_grade(&record.grade),
            mode: record.mode,
            mode_label: record.mode.label(),
            question_text: record.question_text.clone(),
            source_image_url: self.api.asset_url(&record.source_image_url),
            thumb_url: self.api.asset_url(&record.thumb_url),
            solution_thoughts: record.result.solution_thoughts.rendered(),
            explain_to_child: record.result.explain_to_child.rendered(),
            parent_guidance: record.result.parent_guidance.rendered(),
            child_stuck_points: record.result.child_stuck_points.rendered(),
            knowledge_points: record.result.knowledge_points.rendered(),
            solved_label: record
                .solved_at
                .map(|t| format_time(to_local_naive(t)))
                .unwrap_or_default(),
        }
    }

    /// 摘要列表 → 展示条目。now 由调用方传入，日期分桶可独立测试。
    pub fn history_entries(
        &self,
        items: &[RecordSummary],
        now: NaiveDateTime,
    ) -> Vec<HistoryEntry> {
        items
            .iter()
            .map(|item| {
                let solved = item.solved_at.map(to_local_naive).unwrap_or(now);
                HistoryEntry {
                    id: item.id,
                    title: display_title(&item.title, &item.question_text),
                    grade: display_grade(&item.grade),
                    mode: item.mode,
                    mode_label: item.mode.label(),
                    thumb_url: self.api.asset_url(&item.thumb_url),
                    day_bucket: day_bucket(now, solved),
                    time_label: solved.format("%H:%M").to_string(),
                    solved_label: format_time(solved),
                }
            })
            .collect()
    }
}

fn parse_record(value: Option<&serde_json::Value>) -> Result<Option<HomeworkRecord>, AppError> {
    match value {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| AppError::protocol(format!("记录格式无法解析: {}", e))),
    }
}

fn display_title(title: &str, question_text: &str) -> String {
    let title = title.trim();
    if !title.is_empty() {
        return title.to_string();
    }
    let question = question_text.trim();
    if question.is_empty() {
        "题目".to_string()
    } else {
        question.to_string()
    }
}

fn display_grade(grade: &str) -> String {
    let grade = grade.trim();
    if grade.is_empty() {
        "-".to_string()
    } else {
        grade.to_string()
    }
}

fn to_local_naive(t: DateTime<Utc>) -> NaiveDateTime {
    t.with_timezone(&Local).naive_local()
}

/// 日期分桶：同一天 → 今天，前一天 → 昨天，更早 → M月D日。
/// 只看两个时间戳的日历日，纯函数。
pub fn day_bucket(now: NaiveDateTime, solved_at: NaiveDateTime) -> String {
    let days = now
        .date()
        .signed_duration_since(solved_at.date())
        .num_days();
    match days {
        0 => "今天".to_string(),
        1 => "昨天".to_string(),
        _ => {
            use chrono::Datelike;
            format!("{}月{}日", solved_at.date().month(), solved_at.date().day())
        }
    }
}

/// 各端统一的完整时间文案
pub fn format_time(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

/// 详情页展示字段（全部可直接上屏）
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub id: i64,
    pub title: String,
    pub grade: String,
    pub mode: AnalysisMode,
    pub mode_label: &'static str,
    pub question_text: String,
    pub source_image_url: String,
    pub thumb_url: String,
    pub solution_thoughts: String,
    pub explain_to_child: String,
    pub parent_guidance: String,
    pub child_stuck_points: String,
    pub knowledge_points: String,
    pub solved_label: String,
}

/// 历史列表展示条目
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub title: String,
    pub grade: String,
    pub mode: AnalysisMode,
    pub mode_label: &'static str,
    pub thumb_url: String,
    pub day_bucket: String,
    pub time_label: String,
    pub solved_label: String,
}

// ==================== 提交状态机（识别中页面） ====================

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitPhase {
    Idle,
    Submitting,
    Succeeded(i64),
    Failed(String),
}

/// submit 的结果：跳转详情页、忙碌忽略、或给用户的短提示
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Navigate(i64),
    Busy,
    Notice(String),
}

struct SubmitInner {
    phase: SubmitPhase,
    last_input: Option<(String, AnalysisMode)>,
}

/// 单次提交的状态机。同屏只允许一个在途提交，
/// 失败后可用相同输入重试（不需要重新选图）。
pub struct SubmitFlow {
    service: Arc<HomeworkService>,
    inner: Mutex<SubmitInner>,
}

impl SubmitFlow {
    pub fn new(service: Arc<HomeworkService>) -> Self {
        Self {
            service,
            inner: Mutex::new(SubmitInner {
                phase: SubmitPhase::Idle,
                last_input: None,
            }),
        }
    }

    pub async fn phase(&self) -> SubmitPhase {
        self.inner.lock().await.phase.clone()
    }

    pub async fn submit(&self, image_path: &str, mode: AnalysisMode) -> SubmitOutcome {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == SubmitPhase::Submitting {
                debug!("已有提交在途，忽略重复提交");
                return SubmitOutcome::Busy;
            }
            inner.phase = SubmitPhase::Submitting;
            inner.last_input = Some((image_path.to_string(), mode));
        }

        let result = self.service.upload_homework(image_path, mode).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(record) => {
                inner.phase = SubmitPhase::Succeeded(record.id);
                SubmitOutcome::Navigate(record.id)
            }
            Err(e) => {
                let notice = e.user_notice("识别失败，请重试");
                warn!("提交失败: {}", e.message);
                inner.phase = SubmitPhase::Failed(notice.clone());
                SubmitOutcome::Notice(notice)
            }
        }
    }

    /// 失败后用上次输入重试；其余状态下没有可重试的内容
    pub async fn retry(&self) -> SubmitOutcome {
        let input = {
            let inner = self.inner.lock().await;
            match (&inner.phase, &inner.last_input) {
                (SubmitPhase::Failed(_), Some(input)) => Some(input.clone()),
                _ => None,
            }
        };
        match input {
            Some((path, mode)) => self.submit(&path, mode).await,
            None => SubmitOutcome::Notice("没有可重试的提交".to_string()),
        }
    }
}

// ==================== 结果页控制器 ====================

#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    Loaded,
    /// 记录合法地不存在（展示"记录不存在"，而非一般错误）
    Missing,
    /// 页面已离开，结果被丢弃
    Stale,
    Notice(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegenerateOutcome {
    Applied,
    Busy,
    Stale,
    /// 没有待应用的变更
    Noop,
    Notice(String),
}

struct ResultInner {
    record: Option<HomeworkRecord>,
    missing: bool,
    busy: bool,
}

/// 结果页的生命周期守卫：导航代际 + 在途标记。
/// 离开页面后完成的请求只会被丢弃，不会写回任何状态。
pub struct ResultController {
    service: Arc<HomeworkService>,
    inner: Mutex<ResultInner>,
    epoch: AtomicU64,
}

impl ResultController {
    pub fn new(service: Arc<HomeworkService>) -> Self {
        Self {
            service,
            inner: Mutex::new(ResultInner {
                record: None,
                missing: false,
                busy: false,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    /// 当前展示的记录快照
    pub async fn current_record(&self) -> Option<HomeworkRecord> {
        self.inner.lock().await.record.clone()
    }

    pub async fn current_view(&self) -> Option<RecordView> {
        self.current_record()
            .await
            .map(|r| self.service.record_view(&r))
    }

    pub async fn is_missing(&self) -> bool {
        self.inner.lock().await.missing
    }

    /// 离开页面：推进代际，在途请求的结果作废
    pub fn leave(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// 进入页面，按 ID 加载详情
    pub async fn enter(&self, record_id: i64) -> DetailOutcome {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let result = self.service.fetch_detail(record_id).await;

        let mut inner = self.inner.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("页面已离开，丢弃迟到的详情: record={}", record_id);
            return DetailOutcome::Stale;
        }
        match result {
            Ok(record) => {
                inner.missing = false;
                inner.record = Some(record);
                DetailOutcome::Loaded
            }
            Err(e) if e.is_not_found() => {
                inner.missing = true;
                inner.record = None;
                DetailOutcome::Missing
            }
            Err(e) => DetailOutcome::Notice(e.user_notice("加载失败")),
        }
    }

    /// 页面重新可见：消费属于当前记录的挂起模式变更，
    /// 有则立即按新模式重新生成。
    pub async fn on_show(&self) -> RegenerateOutcome {
        let record_id = {
            let inner = self.inner.lock().await;
            match &inner.record {
                Some(record) => record.id,
                None => return RegenerateOutcome::Noop,
            }
        };
        match self.service.modes().consume_pending_change(record_id) {
            Ok(Some(mode)) => {
                info!("应用挂起的模式变更: record={} mode={}", record_id, mode);
                self.regenerate(mode).await
            }
            Ok(None) => RegenerateOutcome::Noop,
            Err(e) => {
                warn!("读取挂起的模式变更失败: {}", e.message);
                RegenerateOutcome::Noop
            }
        }
    }

    /// 用新模式重跑当前记录。成功整体替换快照；
    /// 失败保留旧记录并给出短提示；在途期间的重复调用被忽略。
    pub async fn regenerate(&self, mode: AnalysisMode) -> RegenerateOutcome {
        let (record_id, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.busy {
                debug!("重新生成在途，忽略重复请求");
                return RegenerateOutcome::Busy;
            }
            let record_id = match &inner.record {
                Some(record) => record.id,
                None => return RegenerateOutcome::Notice("记录不存在".to_string()),
            };
            inner.busy = true;
            (record_id, self.epoch.load(Ordering::SeqCst))
        };

        let result = self.service.regenerate(record_id, mode).await;

        let mut inner = self.inner.lock().await;
        inner.busy = false;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("页面已离开，丢弃迟到的重新生成结果: record={}", record_id);
            return RegenerateOutcome::Stale;
        }
        match result {
            Ok(record) => {
                inner.record = Some(record);
                RegenerateOutcome::Applied
            }
            Err(e) => RegenerateOutcome::Notice(e.user_notice("重新生成失败")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_config::{AuthScheme, ClientConfig};
    use crate::local_store::MemoryStore;
    use crate::models::{AnalysisResult, SectionText};
    use crate::session_manager::{LoginCodeProvider, SessionManager};
    use chrono::NaiveDate;

    struct NoLogin;

    #[async_trait::async_trait]
    impl LoginCodeProvider for NoLogin {
        async fn fetch_login_code(&self) -> Result<String, AppError> {
            Err(AppError::auth("测试环境不提供登录 code"))
        }
    }

    fn service() -> HomeworkService {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionManager::new(
            store.clone(),
            AuthScheme::Device,
            Arc::new(NoLogin),
        ));
        let api = Arc::new(ApiClient::new(ClientConfig::default(), session).unwrap());
        let modes = Arc::new(ModeStore::new(store));
        HomeworkService::new(api, modes)
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn day_bucket_today_yesterday_and_date() {
        let now = at(2024, 5, 10, 10, 0);
        assert_eq!(day_bucket(now, at(2024, 5, 10, 19, 50)), "今天");
        assert_eq!(day_bucket(now, at(2024, 5, 9, 20, 10)), "昨天");
        assert_eq!(day_bucket(now, at(2024, 5, 1, 9, 0)), "5月1日");
        // 跨月跨年都按日期文案
        assert_eq!(day_bucket(now, at(2023, 12, 31, 9, 0)), "12月31日");
        // 未来时间不归入今天/昨天
        assert_eq!(day_bucket(now, at(2024, 5, 11, 0, 5)), "5月11日");
    }

    #[test]
    fn format_time_is_zero_padded() {
        assert_eq!(format_time(at(2024, 5, 1, 9, 5)), "2024-05-01 09:05");
    }

    #[test]
    fn record_view_fills_defaults_and_resolves_assets() {
        let svc = service();
        let record = HomeworkRecord {
            id: 42,
            mode: AnalysisMode::Guided,
            question_text: "24 x 15 = ?".to_string(),
            source_image_url: "/uploads/q.png".to_string(),
            result: AnalysisResult {
                solution_thoughts: SectionText::Text("先拆 15".to_string()),
                parent_guidance: SectionText::Lines(vec![
                    "先问怎么拆".to_string(),
                    "引导计算".to_string(),
                ]),
                ..AnalysisResult::default()
            },
            ..HomeworkRecord::default()
        };

        let view = svc.record_view(&record);
        assert_eq!(view.title, "24 x 15 = ?");
        assert_eq!(view.grade, "-");
        assert_eq!(view.mode_label, "引导思考");
        assert_eq!(
            view.source_image_url,
            "http://127.0.0.1:8080/uploads/q.png"
        );
        assert_eq!(view.solution_thoughts, "先拆 15");
        assert_eq!(view.parent_guidance, "1. 先问怎么拆\n2. 引导计算");
        assert_eq!(view.solved_label, "");
    }

    #[test]
    fn history_entries_keep_server_order_and_bucket() {
        let svc = service();
        let now = at(2024, 5, 10, 10, 0);
        let items = vec![
            RecordSummary {
                id: 2,
                title: "阅读理解".to_string(),
                solved_at: Some(
                    to_local_utc(at(2024, 5, 10, 8, 15)),
                ),
                ..RecordSummary::default()
            },
            RecordSummary {
                id: 1,
                grade: "三年级".to_string(),
                solved_at: Some(
                    to_local_utc(at(2024, 5, 9, 20, 10)),
                ),
                ..RecordSummary::default()
            },
        ];

        let entries = svc.history_entries(&items, now);
        // 服务端顺序原样保留
        assert_eq!(entries[0].id, 2);
        assert_eq!(entries[1].id, 1);
        assert_eq!(entries[0].day_bucket, "今天");
        assert_eq!(entries[0].time_label, "08:15");
        assert_eq!(entries[1].day_bucket, "昨天");
        assert_eq!(entries[0].title, "阅读理解");
        assert_eq!(entries[1].title, "题目");
        assert_eq!(entries[1].grade, "三年级");
        assert_eq!(entries[0].grade, "-");
    }

    /// 把本地墙钟时间还原成 Utc 存储值，使断言不受运行时区影响
    fn to_local_utc(naive_local: NaiveDateTime) -> DateTime<Utc> {
        use chrono::TimeZone;
        Local
            .from_local_datetime(&naive_local)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }
}
