//! 微点辅导助手客户端核心
//!
//! 拍作业 → 后端分析 → 分层讲解 的客户端编排层：
//! 身份与会话（设备 ID / 微信 code 兑换）、统一的请求网关与响应归一化、
//! 作业提交与重新生成工作流、讲解模式与挂起变更的持久化。
//! 各端 UI 壳只负责渲染这里返回的展示字段。

pub mod api_client;
pub mod client_config;
pub mod homework_service;
pub mod local_store;
pub mod logging;
pub mod mode_store;
pub mod models;
pub mod session_manager;

use std::sync::Arc;

use api_client::ApiClient;
use client_config::ClientConfig;
use homework_service::HomeworkService;
use local_store::LocalStore;
use mode_store::ModeStore;
use models::AppError;
use session_manager::{LoginCodeProvider, SessionManager};

/// 装配好的服务图。宿主壳持有它，把各页面事件转发给对应服务。
pub struct CoreServices {
    pub session: Arc<SessionManager>,
    pub api: Arc<ApiClient>,
    pub modes: Arc<ModeStore>,
    pub homework: Arc<HomeworkService>,
}

/// 按显式依赖注入装配整套服务（没有全局单例）
pub fn build_core(
    config: ClientConfig,
    store: Arc<dyn LocalStore>,
    code_provider: Arc<dyn LoginCodeProvider>,
) -> Result<CoreServices, AppError> {
    let session = Arc::new(SessionManager::new(
        store.clone(),
        config.auth_scheme,
        code_provider,
    ));
    let api = Arc::new(ApiClient::new(config, session.clone())?);
    let modes = Arc::new(ModeStore::new(store));
    let homework = Arc::new(HomeworkService::new(api.clone(), modes.clone()));
    Ok(CoreServices {
        session,
        api,
        modes,
        homework,
    })
}
