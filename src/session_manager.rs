//! 会话管理
//!
//! 负责调用方身份：匿名设备 ID 或微信 code 兑换的 bearer token。
//! 两种方案由部署变体二选一，对网关只暴露统一的 Credential。
//! 登录兑换是单飞的：并发触发时只发出一次 code 兑换，
//! 其余调用方等待同一结果（code 是一次性的，重复兑换会被后端拒绝）。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::api_client::ApiClient;
use crate::client_config::AuthScheme;
use crate::local_store::{
    LocalStore, LocalStoreExt, KEY_DEVICE_ID, KEY_TOKEN, KEY_USER,
};
use crate::models::{normalize_user, AppError, UserProfile};

/// 登录凭证（每次调用恰好携带一种）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    DeviceId(String),
    Bearer(String),
}

impl Credential {
    /// 凭证对应的请求头，网关不区分方案
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Credential::DeviceId(id) => ("X-Device-Id", id.clone()),
            Credential::Bearer(token) => ("Authorization", format!("Bearer {}", token)),
        }
    }
}

/// 宿主平台的一次性登录 code（wx.login 的等价物）。
/// 用户取消授权时返回 Auth 错误。
#[async_trait]
pub trait LoginCodeProvider: Send + Sync {
    async fn fetch_login_code(&self) -> Result<String, AppError>;
}

pub struct SessionManager {
    store: Arc<dyn LocalStore>,
    scheme: AuthScheme,
    code_provider: Arc<dyn LoginCodeProvider>,
    /// 设备 ID 首次生成互斥，保证同一安装只产生一个 ID
    device_gate: StdMutex<()>,
    /// token + user 成对读写互斥，避免读到半新半旧的会话
    session_gate: StdMutex<()>,
    /// 登录单飞互斥：同一时间至多一次 code 兑换在途
    login_flight: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        scheme: AuthScheme,
        code_provider: Arc<dyn LoginCodeProvider>,
    ) -> Self {
        Self {
            store,
            scheme,
            code_provider,
            device_gate: StdMutex::new(()),
            session_gate: StdMutex::new(()),
            login_flight: Mutex::new(()),
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    // ==================== 设备标识 ====================

    /// 读取或生成稳定的匿名设备 ID。
    /// 已存在时不触发任何写入；首次生成受互斥保护。
    pub fn get_or_create_device_id(&self) -> Result<String, AppError> {
        if let Some(id) = self.read_device_id()? {
            return Ok(id);
        }
        let _gate = self.device_gate.lock().unwrap_or_else(|p| p.into_inner());
        // 拿到锁后复查，竞争方直接复用先行者生成的 ID
        if let Some(id) = self.read_device_id()? {
            return Ok(id);
        }
        let id = format!("dev_{}_{}", Utc::now().timestamp_millis(), nanoid::nanoid!(8));
        self.store.put_json(KEY_DEVICE_ID, &id)?;
        info!("已生成设备标识: {}", id);
        Ok(id)
    }

    fn read_device_id(&self) -> Result<Option<String>, AppError> {
        Ok(self
            .store
            .get_json::<String>(KEY_DEVICE_ID)?
            .filter(|id| !id.trim().is_empty()))
    }

    // ==================== 微信会话 ====================

    /// 当前持久化的 token（空串视同不存在）
    pub fn token(&self) -> Result<Option<String>, AppError> {
        let _gate = self.session_gate.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self
            .store
            .get_json::<String>(KEY_TOKEN)?
            .filter(|t| !t.trim().is_empty()))
    }

    /// 本地缓存的用户资料
    pub fn cached_user(&self) -> Result<Option<UserProfile>, AppError> {
        let _gate = self.session_gate.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.store.get_json::<UserProfile>(KEY_USER)?)
    }

    /// token 与 user 成对落盘。持锁写两个键，
    /// 同进程内后续读取不会看到一个新一个旧。
    pub fn save_session(
        &self,
        token: &str,
        user: Option<serde_json::Value>,
    ) -> Result<(), AppError> {
        let _gate = self.session_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.store.put_json(KEY_TOKEN, &token.to_string())?;
        match user {
            Some(value) if !value.is_null() => {
                self.store.put_json(KEY_USER, &normalize_user(Some(value)))?;
            }
            _ => self.store.remove(KEY_USER)?,
        }
        Ok(())
    }

    /// 显式退出登录：清空会话，设备 ID 保留
    pub fn logout(&self) -> Result<(), AppError> {
        let _gate = self.session_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.store.remove(KEY_TOKEN)?;
        self.store.remove(KEY_USER)?;
        info!("已退出登录");
        Ok(())
    }

    /// 确保存在可用会话。常见路径：token 已在，零网络开销。
    /// 否则走两步兑换：向宿主要 code，经网关的免认证通道换 token。
    pub async fn ensure_session(&self, gateway: &ApiClient) -> Result<Credential, AppError> {
        if let Some(token) = self.token()? {
            return Ok(Credential::Bearer(token));
        }

        let _flight = self.login_flight.lock().await;
        // 等锁期间先行请求可能已完成登录
        if let Some(token) = self.token()? {
            debug!("并发登录已由先行请求完成，直接复用 token");
            return Ok(Credential::Bearer(token));
        }

        let code = self.code_provider.fetch_login_code().await?;
        let payload = gateway
            .call_unauthenticated(
                "/api/v1/auth/wechat/login",
                reqwest::Method::POST,
                Some(serde_json::json!({ "code": code })),
            )
            .await?;

        let token = payload
            .get("token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AppError::auth("登录失败：后端未返回 token"))?
            .to_string();
        self.save_session(&token, payload.get("user").cloned())?;
        info!("微信登录成功");
        Ok(Credential::Bearer(token))
    }

    /// 按部署方案产出凭证。缺失凭证在这里就是错误，
    /// 不存在"静默匿名调用"。
    pub async fn credential(&self, gateway: &ApiClient) -> Result<Credential, AppError> {
        match self.scheme {
            AuthScheme::Device => Ok(Credential::DeviceId(self.get_or_create_device_id()?)),
            AuthScheme::Wechat => self.ensure_session(gateway).await,
        }
    }

    // ==================== 用户资料操作 ====================

    /// GET /api/v1/me，成功后用当前 token 回写缓存用户
    pub async fn fetch_me(&self, gateway: &ApiClient) -> Result<UserProfile, AppError> {
        let payload = gateway
            .call("/api/v1/me", reqwest::Method::GET, None, true)
            .await?;
        self.absorb_user(payload.get("user").cloned())
    }

    /// 同步昵称与头像
    pub async fn update_profile(
        &self,
        gateway: &ApiClient,
        nick_name: &str,
        avatar_url: &str,
    ) -> Result<UserProfile, AppError> {
        let payload = gateway
            .call(
                "/api/v1/auth/wechat/profile",
                reqwest::Method::POST,
                Some(serde_json::json!({ "nickName": nick_name, "avatarUrl": avatar_url })),
                true,
            )
            .await?;
        self.absorb_user(payload.get("user").cloned())
    }

    /// 用手机号授权码绑定手机号
    pub async fn bind_phone_by_code(
        &self,
        gateway: &ApiClient,
        code: &str,
    ) -> Result<UserProfile, AppError> {
        let payload = gateway
            .call(
                "/api/v1/auth/wechat/phone",
                reqwest::Method::POST,
                Some(serde_json::json!({ "code": code })),
                true,
            )
            .await?;
        self.absorb_user(payload.get("user").cloned())
    }

    /// 后端返回的 user 回写本地缓存（保持现有 token），并归一化返回
    fn absorb_user(&self, user: Option<serde_json::Value>) -> Result<UserProfile, AppError> {
        if let Some(value) = user.as_ref().filter(|v| !v.is_null()) {
            let token = self.token()?.unwrap_or_default();
            self.save_session(&token, Some(value.clone()))?;
        }
        Ok(normalize_user(user))
    }
}
