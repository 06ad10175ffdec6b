//! 事件通知：调度器每次状态变化都会推送一个 [`DownloadEvent`]。
//!
//! `EventSink::notify` 在调度器的 actor 内部同步调用，实现方不能阻塞。

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::model::{ItemId, ItemStatus, ProgressSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Enqueued,
    StatusChanged,
    Progress,
    RetryScheduled { attempt: u32, delay: Duration },
    RetryExhausted { attempts: u32, error: String },
    /// 不可重试的传输错误
    Failed { error: String },
    AdmissionDenied { reason: String },
    DeviceUnavailable { device: String },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub item_id: ItemId,
    pub title: String,
    pub status: ItemStatus,
    pub snapshot: ProgressSnapshot,
    pub kind: EventKind,
}

impl DownloadEvent {
    pub fn is_progress(&self) -> bool {
        matches!(self.kind, EventKind::Progress)
    }
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: DownloadEvent);
}

/// 丢弃所有事件
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: DownloadEvent) {}
}

/// 写入 log 日志，进度事件只在 trace 级别输出
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn notify(&self, event: DownloadEvent) {
        match &event.kind {
            EventKind::Progress => log::trace!(
                "[{}] 进度 {}/{:?} 字节, 速度 {} B/s",
                event.title,
                event.snapshot.progress_bytes,
                event.snapshot.size_bytes,
                event.snapshot.speed_bytes_per_sec
            ),
            EventKind::Enqueued => info!("[{}] 已加入队列", event.title),
            EventKind::StatusChanged => info!("[{}] 状态变为 {}", event.title, event.status),
            EventKind::RetryScheduled { attempt, delay } => {
                warn!("[{}] 第 {} 次失败, {:?} 后重试", event.title, attempt, delay)
            }
            EventKind::RetryExhausted { attempts, error } => {
                log::error!("[{}] 重试 {} 次后放弃: {}", event.title, attempts, error)
            }
            EventKind::Failed { error } => log::error!("[{}] 下载失败: {}", event.title, error),
            EventKind::AdmissionDenied { reason } => debug!("[{}] 暂未准入: {}", event.title, reason),
            EventKind::DeviceUnavailable { device } => warn!("[{}] 设备 {} 不可用, 已暂停", event.title, device),
            EventKind::Removed => info!("[{}] 已从队列移除", event.title),
        }
    }
}

/// 转发到 tokio 通道，接收端关闭后静默丢弃
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn notify(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }
}

/// 同时通知多个下游
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn notify(&self, event: DownloadEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(kind: EventKind) -> DownloadEvent {
        DownloadEvent {
            item_id: Uuid::new_v4(),
            title: "a".to_string(),
            status: ItemStatus::Queued,
            snapshot: ProgressSnapshot::default(),
            kind,
        }
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.notify(event(EventKind::Enqueued));
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Enqueued);
        drop(rx);
        // 接收端关闭后不能 panic
        sink.notify(event(EventKind::Removed));
    }

    #[test]
    fn test_fanout_clones_to_every_sink() {
        let (first, mut rx1) = ChannelEventSink::new();
        let (second, mut rx2) = ChannelEventSink::new();
        let fanout = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(second))
            .with(Arc::new(LogEventSink));
        fanout.notify(event(EventKind::Progress));
        assert!(rx1.try_recv().unwrap().is_progress());
        assert!(rx2.try_recv().unwrap().is_progress());
    }
}
