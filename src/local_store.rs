//! 本地键值存储
//!
//! 设备 ID、会话 token、缓存用户、当前模式与挂起的模式变更都落在这里。
//! 实现为 app 数据目录下的 file-per-key JSON 文件，重启后仍在；
//! 测试用内存实现替换。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::models::AppError;

/// 持久化键（逻辑名，与各端 storage key 对齐）
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_TOKEN: &str = "token";
pub const KEY_USER: &str = "user";
pub const KEY_ANALYSIS_MODE: &str = "analysis_mode";
pub const KEY_PENDING_MODE_CHANGE: &str = "pending_mode_change";

#[derive(Debug, thiserror::Error)]
pub enum LocalStoreError {
    #[error("创建存储目录失败: {0}")]
    CreateDir(String),
    #[error("读取存储文件失败: {0}")]
    Read(String),
    #[error("写入存储文件失败: {0}")]
    Write(String),
    #[error("序列化失败: {0}")]
    Serialization(String),
}

impl From<LocalStoreError> for AppError {
    fn from(err: LocalStoreError) -> Self {
        AppError::storage(err.to_string())
    }
}

/// 同步键值存储。写入对同进程内的下一次读取立即可见。
pub trait LocalStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, LocalStoreError>;
    fn put_raw(&self, key: &str, value: &str) -> Result<(), LocalStoreError>;
    fn remove(&self, key: &str) -> Result<(), LocalStoreError>;
}

/// JSON 编解码便捷层
pub trait LocalStoreExt: LocalStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LocalStoreError> {
        match self.get_raw(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // 损坏的存储值按不存在处理，读取方用缺省值兜底
                    warn!("存储键 {} 内容无法解析，按空处理: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LocalStoreError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| LocalStoreError::Serialization(e.to_string()))?;
        self.put_raw(key, &raw)
    }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

// ==================== 文件实现 ====================

/// file-per-key 的磁盘实现，键名做路径安全化
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, LocalStoreError> {
        std::fs::create_dir_all(&dir).map_err(|e| LocalStoreError::CreateDir(e.to_string()))?;
        Ok(Self { dir })
    }

    /// 桌面端默认位置；沙箱/权限受限环境回退到临时目录
    pub fn in_default_location() -> Result<Self, LocalStoreError> {
        let candidate = dirs::data_local_dir()
            .map(|d| d.join("aibuddy"))
            .unwrap_or_else(|| std::env::temp_dir().join("aibuddy"));
        match Self::new(candidate) {
            Ok(store) => Ok(store),
            Err(primary_err) => {
                let fallback = std::env::temp_dir().join("aibuddy");
                warn!("默认存储目录不可用（{}），回退到临时目录", primary_err);
                Self::new(fallback)
            }
        }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace('/', "_")))
    }
}

impl LocalStore for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        match std::fs::read_to_string(self.file_path(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LocalStoreError::Read(e.to_string())),
        }
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        std::fs::write(self.file_path(key), value)
            .map_err(|e| LocalStoreError::Write(e.to_string()))?;
        debug!("已写入存储键: {}", key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let path = self.file_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| LocalStoreError::Write(e.to_string()))?;
        }
        Ok(())
    }
}

// ==================== 内存实现（测试用） ====================

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_roundtrip_and_remove() {
        let dir = TempDir::new().expect("create tempdir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("create store");

        assert_eq!(store.get_raw(KEY_TOKEN).unwrap(), None);

        store.put_json(KEY_TOKEN, &"tk_123".to_string()).unwrap();
        let read: Option<String> = store.get_json(KEY_TOKEN).unwrap();
        assert_eq!(read.as_deref(), Some("tk_123"));

        store.remove(KEY_TOKEN).unwrap();
        assert_eq!(store.get_raw(KEY_TOKEN).unwrap(), None);
        // 删除不存在的键不报错
        store.remove(KEY_TOKEN).unwrap();
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().expect("create tempdir");
        {
            let store = FileStore::new(dir.path().to_path_buf()).expect("create store");
            store.put_json(KEY_DEVICE_ID, &"dev_1_abc".to_string()).unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf()).expect("reopen store");
        let read: Option<String> = store.get_json(KEY_DEVICE_ID).unwrap();
        assert_eq!(read.as_deref(), Some("dev_1_abc"));
    }

    #[test]
    fn corrupted_value_reads_as_none() {
        let dir = TempDir::new().expect("create tempdir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("create store");
        store.put_raw(KEY_USER, "{not json").unwrap();
        let read: Option<serde_json::Value> = store.get_json(KEY_USER).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put_json("k", &42u32).unwrap();
        assert_eq!(store.get_json::<u32>("k").unwrap(), Some(42));
        store.remove("k").unwrap();
        assert_eq!(store.get_json::<u32>("k").unwrap(), None);
    }
}
