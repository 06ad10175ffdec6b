use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::model::{Device, DeviceType, GlobalSettings, ScheduledWindow};
use crate::core::retry::RetryStrategy;
use crate::core::scheduler::SchedulerOptions;
use crate::core::store::{JsonStateStore, StateStore};

const WINDOW_FORMAT: &str = "%H:%M";

/// 配置文件中的设备条目
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    pub storage_capacity_bytes: u64,
    #[serde(default)]
    pub used_storage_bytes: u64,
    pub bandwidth_capacity_bytes_per_sec: u64,
    #[serde(default = "default_true")]
    pub is_online: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(
            self.id.clone(),
            self.storage_capacity_bytes,
            self.bandwidth_capacity_bytes_per_sec,
        )
        .with_used(self.used_storage_bytes)
        .with_type(self.device_type);
        if let Some(name) = &self.name {
            device.name = name.clone();
        }
        device.is_online = self.is_online;
        device
    }
}

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 最大并发下载数
    pub max_concurrent_downloads: usize,
    /// 全局带宽上限（在线设备总带宽的百分比）
    pub global_bandwidth_limit_percent: u8,
    /// 存储准入阈值（设备容量的百分比）
    pub storage_threshold_percent: u8,
    /// 智能队列：同优先级内短任务优先
    pub smart_queue_enabled: bool,
    /// 计划下载窗口开始时间 "HH:MM"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_window_start: Option<String>,
    /// 计划下载窗口结束时间 "HH:MM"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_window_end: Option<String>,
    /// 可重试错误的最大失败次数
    pub retry_max_attempts: u32,
    /// 重试基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 重试最大延迟（毫秒）
    pub retry_max_delay_ms: u64,
    /// 大小未知时的临时存储预留（字节）
    pub unknown_size_reservation_bytes: u64,
    /// 每个下载任务的最低带宽（字节/秒）
    pub min_item_bandwidth: u64,
    /// 周期调度间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 等待传输层停止的超时（毫秒）
    pub cancel_timeout_ms: u64,
    /// 队列状态文件，空字符串表示不持久化
    pub state_file: String,
    /// 事件日志文件，空字符串表示不记录
    pub event_log_file: String,
    /// 事件日志轮转大小（字节）
    pub event_log_max_size: u64,
    /// 启动时注册的设备
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            global_bandwidth_limit_percent: 100,
            storage_threshold_percent: 90,
            smart_queue_enabled: true,
            scheduled_window_start: None,
            scheduled_window_end: None,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            unknown_size_reservation_bytes: 100 * 1024 * 1024,
            min_item_bandwidth: 16 * 1024,
            tick_interval_ms: 1000,
            cancel_timeout_ms: 5000,
            state_file: String::new(),
            event_log_file: "dlqueue_events.log".to_string(),
            event_log_max_size: 10 * 1024 * 1024,
            devices: vec![DeviceConfig {
                id: "local".to_string(),
                name: Some("本机".to_string()),
                device_type: DeviceType::Desktop,
                storage_capacity_bytes: 64 * 1024 * 1024 * 1024,
                used_storage_bytes: 0,
                bandwidth_capacity_bytes_per_sec: 10 * 1024 * 1024,
                is_online: true,
            }],
        }
    }
}

impl Config {
    /// 加载配置文件，文件不存在时写入带教程的默认配置
    pub fn load(path: &str) -> DownloadResult<Self> {
        if !Path::new(path).exists() {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)?;
        match toml::from_str::<Config>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                // 保留用户的文件，不覆盖
                warn!("配置文件格式错误: {}，将使用默认配置", e);
                Ok(Config::default())
            }
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> DownloadResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config_content = toml::to_string_pretty(self)?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    fn generate_tutorial_content() -> String {
        r#"# dlqueue 配置文件
# ====================
#
# TOML 格式，修改后保存即可，下次启动生效。
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   dlqueue https://example.com/a.mp4 https://example.com/b.mp3
#   dlqueue -f urls.txt -m 2                 # 最多同时下载 2 个
#   dlqueue -b 50 https://example.com/a.zip  # 只使用 50% 的设备带宽
#   dlqueue -e                               # 编辑配置文件
#
# ==================== 调度设置 ====================
#
# max_concurrent_downloads        同时下载的任务数上限，必须大于 0
# global_bandwidth_limit_percent  可使用的在线设备总带宽百分比 (1-100)
# storage_threshold_percent       设备已用空间超过该百分比后不再接受新任务 (1-100)
# smart_queue_enabled             同优先级内优先下载较小的文件
# scheduled_window_start/end      只在该时间段内开始新的下载，格式 "HH:MM"，
#                                 结束时间早于开始时间表示跨越午夜，不设置表示随时
#
# ==================== 重试设置 ====================
#
# retry_max_attempts   可重试错误的最大失败次数
# retry_base_delay_ms  第一次重试前的等待时间，之后每次翻倍
# retry_max_delay_ms   重试等待时间的上限
#
# ==================== 高级设置 ====================
#
# unknown_size_reservation_bytes  文件大小未知时预留的存储空间
# min_item_bandwidth              每个下载任务至少分到的带宽（字节/秒）
# tick_interval_ms                周期调度间隔
# cancel_timeout_ms               停止传输时的最长等待时间
# state_file                      队列状态文件，留空则不保存
# event_log_file                  事件日志文件，留空则不记录
# event_log_max_size              事件日志超过该大小后轮转
#
# ==================== 设备 ====================
#
# 每个 [[devices]] 是一个存储设备：
#   id / name / type (mobile, desktop, tablet)
#   storage_capacity_bytes / used_storage_bytes
#   bandwidth_capacity_bytes_per_sec / is_online
#
# ==================== 配置项 ===================="#
            .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> DownloadResult<()> {
        self.global_settings()?;

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(DownloadError::invalid_config("retry_base_delay_ms 不能大于 retry_max_delay_ms"));
        }

        if self.tick_interval_ms == 0 {
            return Err(DownloadError::invalid_config("tick_interval_ms 必须大于 0"));
        }

        let mut seen = Vec::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(DownloadError::invalid_config("设备 id 不能为空"));
            }
            if seen.contains(&&device.id) {
                return Err(DownloadError::DeviceExists(device.id.clone()));
            }
            if device.used_storage_bytes > device.storage_capacity_bytes {
                return Err(DownloadError::invalid_config(format!("设备 {} 已用空间超过容量", device.id)));
            }
            seen.push(&device.id);
        }

        Ok(())
    }

    fn scheduled_window(&self) -> DownloadResult<Option<ScheduledWindow>> {
        match (&self.scheduled_window_start, &self.scheduled_window_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => Ok(Some(ScheduledWindow::new(parse_time(start)?, parse_time(end)?))),
            _ => Err(DownloadError::invalid_config(
                "scheduled_window_start 和 scheduled_window_end 必须同时设置",
            )),
        }
    }

    pub fn global_settings(&self) -> DownloadResult<GlobalSettings> {
        let settings = GlobalSettings {
            max_concurrent_downloads: self.max_concurrent_downloads,
            global_bandwidth_limit_percent: self.global_bandwidth_limit_percent,
            storage_threshold_percent: self.storage_threshold_percent,
            smart_queue_enabled: self.smart_queue_enabled,
            scheduled_window: self.scheduled_window()?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            retry: self.retry_strategy(),
            unknown_size_reservation: self.unknown_size_reservation_bytes,
            min_item_bandwidth: self.min_item_bandwidth,
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceConfig::to_device).collect()
    }

    pub fn state_store(&self) -> Option<Box<dyn StateStore>> {
        if self.state_file.is_empty() {
            None
        } else {
            Some(Box::new(JsonStateStore::new(&self.state_file)))
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(max) = args.max_concurrent {
            self.max_concurrent_downloads = max;
        }
        if let Some(percent) = args.bandwidth_percent {
            self.global_bandwidth_limit_percent = percent;
        }
        if let Some(percent) = args.storage_threshold {
            self.storage_threshold_percent = percent;
        }
        if args.no_smart_queue {
            self.smart_queue_enabled = false;
        }
        if let Some(attempts) = args.retries {
            self.retry_max_attempts = attempts;
        }
        if let Some(state_file) = &args.state_file {
            self.state_file = state_file.clone();
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        let window = match (&self.scheduled_window_start, &self.scheduled_window_end) {
            (Some(start), Some(end)) => format!("{} - {}", start, end),
            _ => "不限".to_string(),
        };
        format!(
            "配置摘要:\n\
            - 并发数: {}\n\
            - 带宽上限: {}%\n\
            - 存储阈值: {}%\n\
            - 智能队列: {}\n\
            - 下载窗口: {}\n\
            - 重试次数: {}\n\
            - 设备数: {}\n\
            - 状态文件: {}",
            self.max_concurrent_downloads,
            self.global_bandwidth_limit_percent,
            self.storage_threshold_percent,
            if self.smart_queue_enabled { "启用" } else { "禁用" },
            window,
            self.retry_max_attempts,
            self.devices.len(),
            if self.state_file.is_empty() { "不保存" } else { &self.state_file },
        )
    }
}

fn parse_time(value: &str) -> DownloadResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), WINDOW_FORMAT)
        .map_err(|_| DownloadError::invalid_config(format!("无效的时间: {}，应为 HH:MM", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.global_bandwidth_limit_percent, 100);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.devices.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.storage_threshold_percent = 101;
        assert!(config.validate().is_err());

        config = Config::default();
        config.global_bandwidth_limit_percent = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.retry_base_delay_ms = 10_000;
        config.retry_max_delay_ms = 1_000;
        assert!(config.validate().is_err());

        config = Config::default();
        config.scheduled_window_start = Some("25:00".to_string());
        config.scheduled_window_end = Some("06:00".to_string());
        assert!(config.validate().is_err());

        config = Config::default();
        config.scheduled_window_start = Some("22:00".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_parsing() {
        let mut config = Config::default();
        config.scheduled_window_start = Some("22:30".to_string());
        config.scheduled_window_end = Some("06:00".to_string());
        let settings = config.global_settings().unwrap();
        let window = settings.scheduled_window.unwrap();
        assert!(window.contains(NaiveTime::from_hms_opt(23, 0, 0).unwrap()));
        assert!(!window.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let mut config = Config::default();
        let device = config.devices[0].clone();
        config.devices.push(device);
        assert!(matches!(config.validate(), Err(DownloadError::DeviceExists(_))));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dlqueue.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.max_concurrent_downloads = 5;
        config.scheduled_window_start = Some("01:00".to_string());
        config.scheduled_window_end = Some("07:00".to_string());
        config.save_with_tutorial(path).expect("保存带教程的配置失败");

        let loaded = Config::load(path).expect("加载配置失败");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_creates_tutorial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dlqueue.toml");
        let path = path.to_str().unwrap();

        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("dlqueue 配置文件"));
        assert!(content.contains("[[devices]]"));
    }

    #[test]
    fn test_malformed_file_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "max_concurrent_downloads = \"many\"").unwrap();
        let path = path.to_str().unwrap();

        let config = Config::load(path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(fs::read_to_string(path).unwrap(), "max_concurrent_downloads = \"many\"");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            "max_concurrent_downloads = 2\n\n[[devices]]\nid = \"phone\"\ntype = \"mobile\"\nstorage_capacity_bytes = 1000\nbandwidth_capacity_bytes_per_sec = 100\n",
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.retry_max_attempts, 3);
        let devices = config.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "phone");
        assert_eq!(devices[0].device_type, DeviceType::Mobile);
        assert!(devices[0].is_online);
    }

    #[test]
    fn test_config_summary() {
        let config = Config::default();
        let summary = config.get_summary();
        assert!(summary.contains("配置摘要"));
        assert!(summary.contains("并发数: 3"));
        assert!(summary.contains("不限"));
        assert!(summary.contains("不保存"));
    }
}
