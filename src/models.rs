//! 数据模型与统一错误类型
//!
//! 定义后端返回的用户 / 作业记录 / 讲解结果的 wire 结构，以及全 crate
//! 共享的 AppError。所有展示字段在反序列化时即归一化，
//! 表现层永远拿不到 null / undefined。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 昵称缺省值（与各端「我的」页面保持一致）
pub const DEFAULT_NICK_NAME: &str = "未设置昵称";

// ==================== 用户 ====================

/// 用户资料，字段齐全、无空洞
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default = "default_nick_name", deserialize_with = "de_nick_name")]
    pub nick_name: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub avatar_url: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub phone_number: String,
    #[serde(default, deserialize_with = "de_count")]
    pub used_count: u32,
    #[serde(default, deserialize_with = "de_count")]
    pub remaining_count: u32,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            nick_name: default_nick_name(),
            avatar_url: String::new(),
            phone_number: String::new(),
            used_count: 0,
            remaining_count: 0,
        }
    }
}

/// 把后端返回的任意 user 载荷归一化成完整的 UserProfile。
/// 后端可能整体省略 user、返回 null、或漏掉个别字段。
pub fn normalize_user(raw: Option<serde_json::Value>) -> UserProfile {
    match raw {
        Some(value) if !value.is_null() => serde_json::from_value(value).unwrap_or_default(),
        _ => UserProfile::default(),
    }
}

fn default_nick_name() -> String {
    DEFAULT_NICK_NAME.to_string()
}

fn de_nick_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(match value {
        Some(s) if !s.trim().is_empty() => s,
        _ => default_nick_name(),
    })
}

fn de_optional_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// 计数字段兼容数字与数字字符串（旧版后端把 usedCount 当字符串返回）
fn de_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(|x| x.min(u32::MAX as u64) as u32)
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u32))
            .unwrap_or(0),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u32)
            .unwrap_or(0),
        _ => 0,
    })
}

// ==================== 讲解模式 ====================

/// 四种固定的讲解模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AnalysisMode {
    #[default]
    Guided,
    Detailed,
    Noanswer,
    Quick,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 4] = [
        AnalysisMode::Guided,
        AnalysisMode::Detailed,
        AnalysisMode::Noanswer,
        AnalysisMode::Quick,
    ];

    /// 枚举之外的取值一律回退到引导思考
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "detailed" => AnalysisMode::Detailed,
            "noanswer" => AnalysisMode::Noanswer,
            "quick" => AnalysisMode::Quick,
            _ => AnalysisMode::Guided,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Guided => "guided",
            AnalysisMode::Detailed => "detailed",
            AnalysisMode::Noanswer => "noanswer",
            AnalysisMode::Quick => "quick",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AnalysisMode::Guided => "引导思考",
            AnalysisMode::Detailed => "详细讲解",
            AnalysisMode::Noanswer => "不给答案模式",
            AnalysisMode::Quick => "快速提示",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AnalysisMode::Guided => "引导孩子一步一步思考（默认推荐）",
            AnalysisMode::Detailed => "完整讲解解题过程和知识点",
            AnalysisMode::Noanswer => "只给思路和提示，不出现答案",
            AnalysisMode::Quick => "快速给出关键提示，节省时间",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AnalysisMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AnalysisMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // 存储或后端里出现过的任何字符串都能反序列化，未知值按默认模式处理
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.as_deref().map(AnalysisMode::parse).unwrap_or_default())
    }
}

// ==================== 讲解结果 ====================

/// 讲解结果的单个板块。后端早期版本返回拼好的字符串，
/// 新版返回字符串数组，两种都接受，渲染结果一致。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SectionText {
    Text(String),
    Lines(Vec<String>),
}

impl Default for SectionText {
    fn default() -> Self {
        SectionText::Text(String::new())
    }
}

impl SectionText {
    /// 统一渲染：字符串原样输出，列表按编号拼接
    pub fn rendered(&self) -> String {
        match self {
            SectionText::Text(s) => s.trim().to_string(),
            SectionText::Lines(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .enumerate()
                .map(|(i, s)| format!("{}. {}", i + 1, s))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rendered().is_empty()
    }
}

impl<'de> Deserialize<'de> for SectionText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => SectionText::Text(s),
            serde_json::Value::Array(items) => SectionText::Lines(
                items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            serde_json::Value::Null => SectionText::default(),
            other => SectionText::Text(other.to_string()),
        })
    }
}

/// AI 讲解结果的五个板块。字段名跟随后端 JSON（snake_case），
/// 同时兼容 Web 端使用的 camelCase。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, alias = "solutionThoughts")]
    pub solution_thoughts: SectionText,
    #[serde(default, alias = "explainToChild")]
    pub explain_to_child: SectionText,
    #[serde(default, alias = "parentGuidance")]
    pub parent_guidance: SectionText,
    #[serde(default, alias = "childStuckPoints")]
    pub child_stuck_points: SectionText,
    #[serde(default, alias = "knowledgePoints")]
    pub knowledge_points: SectionText,
}

// ==================== 作业记录 ====================

/// 作业记录完整快照。页面持有的是不可变快照，
/// 重新生成时整体替换，绝不做字段级修改。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeworkRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub title: String,
    #[serde(default, alias = "suggestedGrade", deserialize_with = "de_optional_text")]
    pub grade: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub thumb_url: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub source_image_url: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub summary: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub question_text: String,
    #[serde(default)]
    pub solved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: AnalysisResult,
}

/// 历史列表里的单条摘要（服务端顺序，客户端不重排）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub mode: AnalysisMode,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub title: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub grade: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub thumb_url: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub summary: String,
    #[serde(default, deserialize_with = "de_optional_text")]
    pub question_text: String,
    #[serde(default)]
    pub solved_at: Option<DateTime<Utc>>,
}

// ==================== 挂起的模式变更 ====================

/// 模式页写入、结果页下次可见时消费的单槽位记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingModeChange {
    pub record_id: i64,
    pub mode: AnalysisMode,
    pub requested_at: DateTime<Utc>,
}

// ==================== 统一错误 ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    /// 本地输入不合法，从不上网络
    Validation,
    /// 登录 / code 兑换失败或被拒绝
    Auth,
    /// 传输失败或被归一化判定为失败的响应
    Gateway,
    /// 2xx 响应缺少工作流必需的字段
    Protocol,
    /// 记录合法地不存在
    NotFound,
    /// 本地持久化读写失败
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Auth, message)
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Gateway, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Protocol, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Storage, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.error_type == AppErrorType::NotFound
    }

    /// 工作流层把错误翻译成给用户看的短提示；消息为空时退回兜底文案
    pub fn user_notice(&self, fallback: &str) -> String {
        let msg = self.message.trim();
        if msg.is_empty() {
            fallback.to_string()
        } else {
            msg.to_string()
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::storage(format!("文件读写失败: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::storage(format!("JSON序列化失败: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::gateway("请求超时，请稍后重试")
        } else if err.is_connect() {
            AppError::gateway("无法连接服务器，请检查网络")
        } else {
            AppError::gateway(format!("网络请求失败: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_user_null_yields_full_defaults() {
        let user = normalize_user(None);
        assert_eq!(user.nick_name, "未设置昵称");
        assert_eq!(user.avatar_url, "");
        assert_eq!(user.phone_number, "");
        assert_eq!(user.used_count, 0);
        assert_eq!(user.remaining_count, 0);

        assert_eq!(normalize_user(Some(serde_json::Value::Null)), user);
    }

    #[test]
    fn normalize_user_coerces_string_counts() {
        let user = normalize_user(Some(json!({"usedCount": "3"})));
        assert_eq!(user.used_count, 3);
        // 其余字段落到缺省值
        assert_eq!(user.nick_name, "未设置昵称");

        let user = normalize_user(Some(json!({"usedCount": "abc", "remainingCount": 7})));
        assert_eq!(user.used_count, 0);
        assert_eq!(user.remaining_count, 7);
    }

    #[test]
    fn normalize_user_keeps_present_fields() {
        let user = normalize_user(Some(json!({
            "nickName": "张妈妈",
            "avatarUrl": "/a.png",
            "phoneNumber": "138****0000",
            "usedCount": 47,
            "remainingCount": 53
        })));
        assert_eq!(user.nick_name, "张妈妈");
        assert_eq!(user.avatar_url, "/a.png");
        assert_eq!(user.used_count, 47);
        assert_eq!(user.remaining_count, 53);
    }

    #[test]
    fn mode_parse_coerces_unknown_to_guided() {
        assert_eq!(AnalysisMode::parse("detailed"), AnalysisMode::Detailed);
        assert_eq!(AnalysisMode::parse("noanswer"), AnalysisMode::Noanswer);
        assert_eq!(AnalysisMode::parse("quick"), AnalysisMode::Quick);
        assert_eq!(AnalysisMode::parse("guided"), AnalysisMode::Guided);
        assert_eq!(AnalysisMode::parse(""), AnalysisMode::Guided);
        assert_eq!(AnalysisMode::parse("socratic"), AnalysisMode::Guided);
    }

    #[test]
    fn section_text_renders_string_and_list_the_same_way() {
        let text = SectionText::Text("先拆 15，再分别相乘".to_string());
        assert_eq!(text.rendered(), "先拆 15，再分别相乘");

        let lines = SectionText::Lines(vec![
            "先问怎么拆 15".to_string(),
            "引导算 24x5 和 24x10".to_string(),
            "".to_string(),
        ]);
        assert_eq!(lines.rendered(), "1. 先问怎么拆 15\n2. 引导算 24x5 和 24x10");
    }

    #[test]
    fn analysis_result_accepts_both_casings_and_shapes() {
        let snake: AnalysisResult = serde_json::from_value(json!({
            "solution_thoughts": "思路",
            "parent_guidance": ["第一句", "第二句"]
        }))
        .unwrap();
        assert_eq!(snake.solution_thoughts.rendered(), "思路");
        assert_eq!(snake.parent_guidance.rendered(), "1. 第一句\n2. 第二句");
        assert!(snake.knowledge_points.is_empty());

        let camel: AnalysisResult = serde_json::from_value(json!({
            "solutionThoughts": "思路",
            "childStuckPoints": null
        }))
        .unwrap();
        assert_eq!(camel.solution_thoughts.rendered(), "思路");
        assert!(camel.child_stuck_points.is_empty());
    }

    #[test]
    fn record_tolerates_missing_fields_and_bad_mode() {
        let record: HomeworkRecord = serde_json::from_value(json!({
            "id": 42,
            "mode": "whatever",
            "questionText": "24 x 15 = ?"
        }))
        .unwrap();
        assert_eq!(record.id, 42);
        assert_eq!(record.mode, AnalysisMode::Guided);
        assert_eq!(record.question_text, "24 x 15 = ?");
        assert_eq!(record.grade, "");
        assert!(record.solved_at.is_none());
    }

    #[test]
    fn record_accepts_suggested_grade_alias() {
        let record: HomeworkRecord = serde_json::from_value(json!({
            "id": 1,
            "suggestedGrade": "三年级"
        }))
        .unwrap();
        assert_eq!(record.grade, "三年级");
    }

    #[test]
    fn app_error_notice_falls_back_when_empty() {
        let err = AppError::gateway("quota exceeded");
        assert_eq!(err.user_notice("加载失败"), "quota exceeded");

        let err = AppError::gateway("  ");
        assert_eq!(err.user_notice("加载失败"), "加载失败");
    }
}
