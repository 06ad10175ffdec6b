//! 下载队列的数据模型：任务、设备、全局设置

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::{DownloadError, DownloadResult};

pub type ItemId = Uuid;
pub type DeviceId = String;

/// 任务优先级，High > Normal > Low
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    /// 从高到低遍历
    pub const TIERS: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Video,
    Audio,
    Document,
    Image,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Error)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Downloading => "downloading",
            ItemStatus::Paused => "paused",
            ItemStatus::Completed => "completed",
            ItemStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 暂停原因，决定暂停的任务能否被调度器自动恢复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// 用户手动暂停
    User,
    /// 设备离线被驱逐
    DeviceOffline,
    /// 设置收紧后被抢占
    Preempted,
    /// 进程重启前正在下载
    Restart,
    /// 用户请求恢复但尚未获得准入
    ResumeRequested,
}

impl PauseReason {
    pub fn auto_resumes(&self) -> bool {
        !matches!(self, PauseReason::User)
    }
}

/// 下载任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: ItemId,
    pub title: String,
    pub url: String,
    pub media_type: MediaType,
    /// 总大小，传输层报告响应头之前可能未知
    pub size_bytes: Option<u64>,
    pub priority: Priority,
    pub status: ItemStatus,
    pub progress_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub estimated_seconds_remaining: Option<u64>,
    /// 当前分配到的带宽 (B/s)
    pub allocated_bandwidth: u64,
    /// 占用哪个设备的存储和带宽
    pub assigned_device_id: Option<DeviceId>,
    /// 调用方指定的目标设备
    pub target_device_id: Option<DeviceId>,
    pub attempts: u32,
    pub pause_reason: Option<PauseReason>,
    pub last_error: Option<String>,
    /// 入队顺序，FIFO 兜底排序
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadItem {
    pub fn new(request: EnqueueRequest, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: request.title,
            url: request.url,
            media_type: request.media_type,
            size_bytes: request.size_hint,
            priority: request.priority,
            status: ItemStatus::Queued,
            progress_bytes: 0,
            speed_bytes_per_sec: 0,
            estimated_seconds_remaining: None,
            allocated_bandwidth: 0,
            assigned_device_id: None,
            target_device_id: request.device_id,
            attempts: 0,
            pause_reason: None,
            last_error: None,
            sequence,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// 清空速度相关的派生字段
    pub fn clear_rates(&mut self) {
        self.speed_bytes_per_sec = 0;
        self.allocated_bandwidth = 0;
        self.estimated_seconds_remaining = None;
    }

    /// 仍需下载的字节数（大小未知时为 None）
    pub fn remaining_bytes(&self) -> Option<u64> {
        self.size_bytes.map(|size| size.saturating_sub(self.progress_bytes))
    }

    pub fn progress_percent(&self) -> Option<f64> {
        match (self.status, self.size_bytes) {
            (ItemStatus::Completed, _) => Some(100.0),
            (_, Some(0)) => Some(0.0),
            (_, Some(size)) => Some(self.progress_bytes as f64 / size as f64 * 100.0),
            (_, None) => None,
        }
    }

    /// 是否是本轮调度的候选项
    pub fn is_candidate(&self) -> bool {
        match self.status {
            ItemStatus::Queued => true,
            ItemStatus::Paused => self.pause_reason.map(|r| r.auto_resumes()).unwrap_or(false),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            progress_bytes: self.progress_bytes,
            size_bytes: self.size_bytes,
            speed_bytes_per_sec: self.speed_bytes_per_sec,
            estimated_seconds_remaining: self.estimated_seconds_remaining,
            allocated_bandwidth: self.allocated_bandwidth,
            attempts: self.attempts,
        }
    }
}

/// 进度快照，随事件一起发出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress_bytes: u64,
    pub size_bytes: Option<u64>,
    pub speed_bytes_per_sec: u64,
    pub estimated_seconds_remaining: Option<u64>,
    pub allocated_bandwidth: u64,
    pub attempts: u32,
}

/// 入队请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub title: String,
    pub url: String,
    pub size_hint: Option<u64>,
    pub priority: Priority,
    pub media_type: MediaType,
    pub device_id: Option<DeviceId>,
}

impl EnqueueRequest {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            size_hint: None,
            priority: Priority::Normal,
            media_type: MediaType::default(),
            device_id: None,
        }
    }

    pub fn size(mut self, bytes: u64) -> Self {
        self.size_hint = Some(bytes);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    #[default]
    Desktop,
    Tablet,
}

/// 存储设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    pub storage_capacity_bytes: u64,
    /// 已用空间，注册时为设备上的既有占用
    #[serde(default)]
    pub used_storage_bytes: u64,
    pub bandwidth_capacity_bytes_per_sec: u64,
    #[serde(default = "default_online")]
    pub is_online: bool,
}

fn default_online() -> bool {
    true
}

impl Device {
    pub fn new(
        id: impl Into<DeviceId>,
        storage_capacity_bytes: u64,
        bandwidth_capacity_bytes_per_sec: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            device_type: DeviceType::Desktop,
            storage_capacity_bytes,
            used_storage_bytes: 0,
            bandwidth_capacity_bytes_per_sec,
            is_online: true,
        }
    }

    pub fn with_used(mut self, used: u64) -> Self {
        self.used_storage_bytes = used;
        self
    }

    pub fn with_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }
}

/// 计划下载时间窗口，end 小于 start 表示跨越午夜
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduledWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// 全局调度设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub max_concurrent_downloads: usize,
    /// 可使用的在线设备总带宽百分比 (1..=100)
    pub global_bandwidth_limit_percent: u8,
    /// 设备存储准入阈值百分比 (1..=100)
    pub storage_threshold_percent: u8,
    pub smart_queue_enabled: bool,
    pub scheduled_window: Option<ScheduledWindow>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            global_bandwidth_limit_percent: 100,
            storage_threshold_percent: 90,
            smart_queue_enabled: true,
            scheduled_window: None,
        }
    }
}

impl GlobalSettings {
    pub fn window_permits(&self, now: NaiveTime) -> bool {
        self.scheduled_window.map(|w| w.contains(now)).unwrap_or(true)
    }

    pub fn validate(&self) -> DownloadResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(DownloadError::invalid_config("max_concurrent_downloads 必须大于 0"));
        }
        if !(1..=100).contains(&self.global_bandwidth_limit_percent) {
            return Err(DownloadError::invalid_config("global_bandwidth_limit_percent 必须在 1-100 之间"));
        }
        if !(1..=100).contains(&self.storage_threshold_percent) {
            return Err(DownloadError::invalid_config("storage_threshold_percent 必须在 1-100 之间"));
        }
        if let Some(window) = self.scheduled_window {
            if window.start == window.end {
                return Err(DownloadError::invalid_config("scheduled_window 的开始和结束时间不能相同"));
            }
        }
        Ok(())
    }
}

/// 列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub status: Option<ItemStatus>,
    pub priority: Option<Priority>,
    pub media_type: Option<MediaType>,
    pub device_id: Option<DeviceId>,
}

impl ItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &DownloadItem) -> bool {
        self.status.map_or(true, |s| item.status == s)
            && self.priority.map_or(true, |p| item.priority == p)
            && self.media_type.map_or(true, |m| item.media_type == m)
            && self.device_id.as_ref().map_or(true, |d| {
                item.assigned_device_id.as_ref() == Some(d) || item.target_device_id.as_ref() == Some(d)
            })
    }
}
