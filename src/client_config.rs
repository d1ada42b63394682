//! 客户端运行配置
//!
//! API 基址、认证方案、响应协议与超时。配置来源：
//! `config/client.toml`（可选）+ 环境变量（前缀 AIBUDDY），
//! 宿主壳也可以直接构造 ClientConfig 注入。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 各端开发环境共用的默认后端地址
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
/// 上传要等后端完成一次 AI 分析，超时按模型调用上限放宽
const DEFAULT_UPLOAD_TIMEOUT_MS: u64 = 45_000;

/// 凭证方案。每个部署变体二选一，网关不感知具体方案。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// 匿名设备标识（X-Device-Id）
    #[default]
    Device,
    /// 微信 code 兑换 token（Authorization: Bearer）
    Wechat,
}

/// 后端响应协议。小程序后端用裸 HTTP + error 字段，
/// 新后端统一 {code, message, data} 信封。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseConvention {
    #[default]
    Envelope,
    #[serde(rename = "http")]
    HttpError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base: String,
    pub auth_scheme: AuthScheme,
    pub response_convention: ResponseConvention,
    pub request_timeout_ms: Option<u64>,
    pub upload_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            auth_scheme: AuthScheme::default(),
            response_convention: ResponseConvention::default(),
            request_timeout_ms: None,
            upload_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// 从配置文件和环境变量装配配置
    pub fn from_env_and_file() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder().add_source(
            config::Environment::with_prefix("AIBUDDY")
                .separator("__")
                .list_separator(","),
        );
        if std::path::Path::new("config/client.toml").exists() {
            builder = builder.add_source(config::File::with_name("config/client"));
        }
        let loaded = builder
            .build()
            .unwrap_or_else(|_| config::Config::builder().build().unwrap());

        let mut cfg = ClientConfig::default();
        if let Ok(val) = loaded.try_deserialize::<serde_json::Value>() {
            cfg = serde_json::from_value::<ClientConfig>(val).unwrap_or(cfg);
        }
        // direct env fallback（沿用老脚手架的变量名）
        if cfg.api_base == DEFAULT_API_BASE {
            if let Ok(base) = std::env::var("API_BASE") {
                if !base.trim().is_empty() {
                    cfg.api_base = base;
                }
            }
        }
        cfg.normalize()
    }

    /// 校验并整理 api_base（去掉末尾斜杠，拒绝非法 URL）
    pub fn normalize(mut self) -> anyhow::Result<Self> {
        let trimmed = self.api_base.trim().trim_end_matches('/').to_string();
        url::Url::parse(&trimmed)
            .map_err(|e| anyhow::anyhow!("api_base 不是合法 URL ({}): {}", trimmed, e))?;
        self.api_base = trimmed;
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_slash() {
        let cfg = ClientConfig {
            api_base: "http://127.0.0.1:8080/".to_string(),
            ..ClientConfig::default()
        };
        let cfg = cfg.normalize().expect("normalize");
        assert_eq!(cfg.api_base, "http://127.0.0.1:8080");
    }

    #[test]
    fn normalize_rejects_garbage_base() {
        let cfg = ClientConfig {
            api_base: "not a url".to_string(),
            ..ClientConfig::default()
        };
        assert!(cfg.normalize().is_err());
    }

    #[test]
    fn timeouts_have_sane_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.request_timeout(), Duration::from_millis(15_000));
        assert_eq!(cfg.upload_timeout(), Duration::from_millis(45_000));
    }
}
