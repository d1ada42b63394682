//! API 网关
//!
//! 所有后端调用的唯一出口：拼 URL、带凭证头、发请求，
//! 并把两种后端响应协议（裸 HTTP + error 字段 / {code, message, data} 信封）
//! 归一化成统一的成功 / 失败契约。
//! 二进制上传走独立通道，传输层返回的字符串体在这里解析并套用同一套归一化。

use reqwest::Method;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client_config::{ClientConfig, ResponseConvention};
use crate::models::AppError;
use crate::session_manager::{Credential, SessionManager};

pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, session: Arc<SessionManager>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::gateway(format!("创建HTTP客户端失败: {}", e)))?;
        Ok(Self {
            http,
            config,
            session,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    /// 后端返回的资源地址可能是绝对 URL，也可能是根相对路径。
    /// 相对路径拼到 API 基址上，绝不重复加前缀。
    pub fn asset_url(&self, path: &str) -> String {
        let p = path.trim();
        if p.is_empty() {
            return String::new();
        }
        if p.starts_with("http://") || p.starts_with("https://") {
            return p.to_string();
        }
        if p.starts_with('/') {
            format!("{}{}", self.config.api_base, p)
        } else {
            format!("{}/{}", self.config.api_base, p)
        }
    }

    /// 标准 JSON 调用。requires_auth 时先向会话层要凭证；
    /// 拿不到凭证本身就是错误，不会降级成匿名调用。
    pub async fn call(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
        requires_auth: bool,
    ) -> Result<Value, AppError> {
        let credential = if requires_auth {
            Some(self.session.credential(self).await?)
        } else {
            None
        };
        self.dispatch(path, method, body, credential).await
    }

    /// 免认证通道，登录兑换自身走这里（避免自举递归）
    pub(crate) async fn call_unauthenticated(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, AppError> {
        self.dispatch(path, method, body, None).await
    }

    async fn dispatch(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
        credential: Option<Credential>,
    ) -> Result<Value, AppError> {
        debug!("{} {}", method, path);
        let mut request = self
            .http
            .request(method, self.endpoint(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(credential) = credential {
            let (name, value) = credential.header();
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(AppError::from)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(AppError::from)?;
        normalize_response(self.config.response_convention, status, &text).map_err(|e| {
            warn!("请求失败 {} -> {}", path, e.message);
            e
        })
    }

    /// 上传本地文件 + 附加表单字段（multipart）。
    /// 上传端点的响应体按文本读回再解析 JSON，解析失败是独立的错误，
    /// 与传输层失败区分开。
    pub async fn upload_file(
        &self,
        path: &str,
        file_path: &Path,
        file_field: &str,
        fields: &[(&str, String)],
        requires_auth: bool,
    ) -> Result<Value, AppError> {
        let bytes = tokio::fs::read(file_path).await?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.jpg".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(guess_mime(file_path))
            .map_err(AppError::from)?;

        let mut form = reqwest::multipart::Form::new().part(file_field.to_string(), part);
        for (key, value) in fields {
            form = form.text(key.to_string(), value.clone());
        }

        let mut request = self
            .http
            .request(Method::POST, self.endpoint(path))
            .timeout(self.config.upload_timeout())
            .multipart(form);
        if requires_auth {
            let (name, value) = self.session.credential(self).await?.header();
            request = request.header(name, value);
        }

        debug!("POST {} (multipart)", path);
        let response = request.send().await.map_err(AppError::from)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(AppError::from)?;

        let payload: Value = serde_json::from_str(text.trim())
            .map_err(|_| AppError::gateway("invalid upload response"))?;
        normalize_payload(self.config.response_convention, status, payload).map_err(|e| {
            warn!("上传失败 {} -> {}", path, e.message);
            e
        })
    }
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// 文本响应体 → 统一载荷。解析不出 JSON 的失败状态仍然能给出
/// "HTTP <status>"，解析不出的成功状态按协议违例处理。
fn normalize_response(
    convention: ResponseConvention,
    status: u16,
    body: &str,
) -> Result<Value, AppError> {
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(payload) => normalize_payload(convention, status, payload),
        Err(_) => {
            if (200..300).contains(&status) {
                Err(AppError::gateway("empty response"))
            } else {
                Err(AppError::with_details(
                    crate::models::AppErrorType::Gateway,
                    format!("HTTP {}", status),
                    serde_json::json!({ "status": status }),
                ))
            }
        }
    }
}

/// 已解析载荷 → 成功数据或失败消息。
/// 失败判定：HTTP 状态不在 [200,300)、信封 code != 0、载荷不是对象。
/// 失败消息优先级：message > error > "HTTP <status>"。
fn normalize_payload(
    convention: ResponseConvention,
    status: u16,
    payload: Value,
) -> Result<Value, AppError> {
    if !(200..300).contains(&status) {
        return Err(AppError::with_details(
            crate::models::AppErrorType::Gateway,
            best_message(&payload, status),
            serde_json::json!({ "status": status }),
        ));
    }

    let Some(object) = payload.as_object() else {
        return Err(AppError::gateway("empty response"));
    };

    match convention {
        ResponseConvention::HttpError => Ok(payload.clone()),
        ResponseConvention::Envelope => {
            let code = object.get("code").and_then(Value::as_i64).unwrap_or(-1);
            if code != 0 {
                let message = object
                    .get("message")
                    .and_then(Value::as_str)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or("request failed");
                return Err(AppError::with_details(
                    crate::models::AppErrorType::Gateway,
                    message,
                    serde_json::json!({ "code": code }),
                ));
            }
            Ok(object.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default())))
        }
    }
}

fn best_message(payload: &Value, status: u16) -> String {
    for key in ["message", "error"] {
        if let Some(msg) = payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
        {
            return msg.to_string();
        }
    }
    format!("HTTP {}", status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_success_extracts_data() {
        let payload = json!({"code": 0, "message": "ok", "data": {"items": [1, 2]}});
        let data = normalize_payload(ResponseConvention::Envelope, 200, payload).unwrap();
        assert_eq!(data, json!({"items": [1, 2]}));
    }

    #[test]
    fn envelope_success_without_data_yields_empty_object() {
        let payload = json!({"code": 0});
        let data = normalize_payload(ResponseConvention::Envelope, 200, payload).unwrap();
        assert_eq!(data, json!({}));
    }

    #[test]
    fn envelope_nonzero_code_is_failure_even_on_http_200() {
        let payload = json!({"code": 1, "message": "quota exceeded"});
        let err = normalize_payload(ResponseConvention::Envelope, 200, payload).unwrap_err();
        assert_eq!(err.message, "quota exceeded");
    }

    #[test]
    fn envelope_missing_code_is_failure() {
        let payload = json!({"data": {}});
        let err = normalize_payload(ResponseConvention::Envelope, 200, payload).unwrap_err();
        assert_eq!(err.message, "request failed");
    }

    #[test]
    fn http_convention_passes_2xx_payload_through() {
        let payload = json!({"token": "tk", "user": {"nickName": "张妈妈"}});
        let data = normalize_payload(ResponseConvention::HttpError, 200, payload.clone()).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn failure_message_priority_message_over_error_over_status() {
        let err = normalize_payload(
            ResponseConvention::HttpError,
            500,
            json!({"message": "具体原因", "error": "db error"}),
        )
        .unwrap_err();
        assert_eq!(err.message, "具体原因");

        let err = normalize_payload(
            ResponseConvention::HttpError,
            500,
            json!({"error": "db error"}),
        )
        .unwrap_err();
        assert_eq!(err.message, "db error");

        let err =
            normalize_payload(ResponseConvention::HttpError, 502, json!({"other": 1})).unwrap_err();
        assert_eq!(err.message, "HTTP 502");
    }

    #[test]
    fn unparsable_body_is_failure_in_both_directions() {
        let err = normalize_response(ResponseConvention::Envelope, 200, "<html>oops</html>")
            .unwrap_err();
        assert_eq!(err.message, "empty response");

        let err =
            normalize_response(ResponseConvention::Envelope, 503, "Bad Gateway").unwrap_err();
        assert_eq!(err.message, "HTTP 503");
    }

    #[test]
    fn non_object_2xx_payload_is_failure() {
        let err = normalize_payload(ResponseConvention::Envelope, 200, json!("plain")).unwrap_err();
        assert_eq!(err.message, "empty response");
    }

    #[test]
    fn asset_url_resolution() {
        let config = ClientConfig::default();
        let session = Arc::new(crate::session_manager::SessionManager::new(
            Arc::new(crate::local_store::MemoryStore::new()),
            crate::client_config::AuthScheme::Device,
            Arc::new(DenyLogin),
        ));
        let client = ApiClient::new(config, session).unwrap();

        assert_eq!(
            client.asset_url("https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(
            client.asset_url("/uploads/a.png"),
            "http://127.0.0.1:8080/uploads/a.png"
        );
        assert_eq!(
            client.asset_url("uploads/a.png"),
            "http://127.0.0.1:8080/uploads/a.png"
        );
        assert_eq!(client.asset_url("  "), "");
    }

    struct DenyLogin;

    #[async_trait::async_trait]
    impl crate::session_manager::LoginCodeProvider for DenyLogin {
        async fn fetch_login_code(&self) -> Result<String, AppError> {
            Err(AppError::auth("测试环境不提供登录 code"))
        }
    }
}
