//! 队列状态持久化：JSON 快照，写临时文件后原子替换

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::error::{DownloadError, DownloadResult};
use super::ledger::LedgerEntry;
use super::model::{Device, DownloadItem, GlobalSettings};

pub const SNAPSHOT_VERSION: u32 = 1;

/// 重启后恢复调度所需的全部状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub settings: GlobalSettings,
    /// 设备的 used_storage_bytes 是注册时的既有占用，不含预留
    pub devices: Vec<Device>,
    pub items: Vec<DownloadItem>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
}

pub trait StateStore: Send {
    fn load(&self) -> DownloadResult<Option<QueueSnapshot>>;
    fn save(&self, snapshot: &QueueSnapshot) -> DownloadResult<()>;
}

pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> DownloadResult<Option<QueueSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let snapshot: QueueSnapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(DownloadError::invalid_config(format!(
                "状态文件 {} 的版本 {} 不受支持 (当前版本 {})",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        info!(
            "从 {} 恢复队列状态: {} 个任务, {} 台设备",
            self.path.display(),
            snapshot.items.len(),
            snapshot.devices.len()
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &QueueSnapshot) -> DownloadResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        debug!("队列状态已保存到 {}", self.path.display());
        Ok(())
    }
}
