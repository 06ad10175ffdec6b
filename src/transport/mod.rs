//! Transport：真正搬运字节的外部协作者。
//!
//! 调度器只通过这里的 trait 与传输层交互：`start` 返回一个事件流，
//! `set_bandwidth` 调整限速，`stop` 协作式停止。

mod sim;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::core::error::TransportError;
use crate::core::model::ItemId;

pub use sim::{FailurePlan, SimulatedTransport, SpeedLimiter};

/// 一次传输的句柄；run_id 在每次启动时递增，用来丢弃过期的上报
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    pub item_id: ItemId,
    pub run_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub handle: TransferHandle,
    pub url: String,
    /// 断点续传的起始偏移
    pub resume_from: u64,
    pub size_hint: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 响应头给出的总大小
    SizeKnown(u64),
    /// 新增的字节数
    Progress(u64),
    Done,
    Failed(TransportError),
}

pub type TransferStream = BoxStream<'static, TransferEvent>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn start(&self, request: TransferRequest, bandwidth: u64) -> TransferStream;

    fn set_bandwidth(&self, handle: &TransferHandle, bytes_per_sec: u64);

    async fn stop(&self, handle: &TransferHandle);
}
