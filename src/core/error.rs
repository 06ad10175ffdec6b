use thiserror::Error;
use std::fmt;
use std::io;

use super::model::{DeviceId, ItemId, ItemStatus};

/// 传输层错误（由 Transport 异步上报）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("传输超时")]
    Timeout,

    #[error("服务器错误: HTTP {0}")]
    Server(u16),

    #[error("客户端错误: HTTP {0}")]
    Client(u16),

    #[error("IO错误: {0}")]
    Io(String),

    #[error("文件大小不匹配: 预期 {expected} 字节, 实际 {actual} 字节")]
    SizeMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),

    #[error("传输被中止")]
    Aborted,
}

impl TransportError {
    /// 网络抖动、超时、5xx 和本地 IO 可以重试，其余直接失败
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_)
                | TransportError::Timeout
                | TransportError::Server(_)
                | TransportError::Io(_)
                | TransportError::SizeMismatch { .. }
                | TransportError::Aborted
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// 准入被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDenial {
    /// 并发槽位已满
    NoSlots,
    /// 当前不在计划下载时间窗口内
    OutsideWindow,
    /// 没有在线设备
    NoOnlineDevice,
    /// 设备离线
    DeviceOffline(DeviceId),
    /// 存储空间不足
    InsufficientStorage {
        device: DeviceId,
        required: u64,
        available: u64,
    },
    /// 带宽不足以提供最低保障
    InsufficientBandwidth(DeviceId),
    /// 本轮调度中被更高优先级的任务抢先
    Deferred,
}

impl fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDenial::NoSlots => write!(f, "并发槽位已满"),
            AdmissionDenial::OutsideWindow => write!(f, "不在计划下载时间窗口内"),
            AdmissionDenial::NoOnlineDevice => write!(f, "没有可用的在线设备"),
            AdmissionDenial::DeviceOffline(id) => write!(f, "设备离线: {}", id),
            AdmissionDenial::InsufficientStorage { device, required, available } => write!(
                f,
                "设备 {} 存储空间不足: 需要 {} 字节, 可用 {} 字节",
                device, required, available
            ),
            AdmissionDenial::InsufficientBandwidth(id) => write!(f, "设备 {} 带宽不足", id),
            AdmissionDenial::Deferred => write!(f, "等待下一轮调度"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("准入被拒绝: {0}")]
    AdmissionDenied(AdmissionDenial),

    #[error("传输错误: {0}")]
    Transport(#[from] TransportError),

    #[error("重试次数超过限制: 共尝试 {attempts} 次, 最后错误: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("无效的状态转换: 任务 {id} 处于 {from} 状态, 不能执行 {action}")]
    InvalidTransition {
        id: ItemId,
        from: ItemStatus,
        action: &'static str,
    },

    #[error("设备不可用: {0}")]
    DeviceUnavailable(DeviceId),

    #[error("任务不存在: {0}")]
    ItemNotFound(ItemId),

    #[error("设备不存在: {0}")]
    DeviceNotFound(DeviceId),

    #[error("设备已存在: {0}")]
    DeviceExists(DeviceId),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("调度器不可用: {0}")]
    Mailbox(#[from] actix::MailboxError),
}

impl DownloadError {
    pub fn invalid_transition(id: ItemId, from: ItemStatus, action: &'static str) -> Self {
        DownloadError::InvalidTransition { id, from, action }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        DownloadError::InvalidConfig(msg.into())
    }

    /// 准入失败和设备离线不是任务本身的错误，调用方可以稍后重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DownloadError::AdmissionDenied(_) | DownloadError::DeviceUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::Serialization(error.to_string())
    }
}

impl From<toml::de::Error> for DownloadError {
    fn from(error: toml::de::Error) -> Self {
        DownloadError::InvalidConfig(error.to_string())
    }
}

impl From<toml::ser::Error> for DownloadError {
    fn from(error: toml::ser::Error) -> Self {
        DownloadError::Serialization(error.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transport_error_retryable() {
        assert!(TransportError::Network("connection reset".to_string()).is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Server(503).is_retryable());
        assert!(TransportError::SizeMismatch { expected: 10, actual: 5 }.is_retryable());
    }

    #[test]
    fn test_transport_error_fatal() {
        assert!(TransportError::Client(404).is_fatal());
        assert!(TransportError::UnsupportedProtocol("ftp".to_string()).is_fatal());
    }

    #[test]
    fn test_error_transient() {
        let denied = DownloadError::AdmissionDenied(AdmissionDenial::NoSlots);
        assert!(denied.is_transient());

        let invalid = DownloadError::invalid_transition(Uuid::new_v4(), ItemStatus::Completed, "resume");
        assert!(!invalid.is_transient());
        assert!(invalid.to_string().contains("resume"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "磁盘故障");
        let err: DownloadError = io_err.into();
        assert!(matches!(err, DownloadError::IoError(_)));

        let err: DownloadError = TransportError::Timeout.into();
        assert!(matches!(err, DownloadError::Transport(TransportError::Timeout)));
    }
}
