//! 传输 worker：每个下载中的任务一个，驱动传输层的事件流并回报给调度器

use std::sync::Arc;
use std::time::Duration;

use actix::Addr;
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::oneshot;

use super::error::TransportError;
use super::manager::DownloadManagerActor;
use super::messages::TransferReport;
use crate::transport::{TransferEvent, TransferHandle, TransferStream, Transport};

/// worker 主循环：收到停止信号或流结束时退出
pub async fn run(
    handle: TransferHandle,
    mut stream: TransferStream,
    mut stop: oneshot::Receiver<()>,
    manager: Addr<DownloadManagerActor>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                debug!("worker {} (run {}) 收到停止信号", handle.item_id, handle.run_id);
                return;
            }
            event = stream.next() => {
                let event = event.unwrap_or(TransferEvent::Failed(TransportError::Aborted));
                let terminal = matches!(event, TransferEvent::Done | TransferEvent::Failed(_));
                manager.do_send(TransferReport { handle, event });
                if terminal {
                    return;
                }
            }
        }
    }
}

/// 通知传输层停止；超时后放弃等待，调度器早已释放资源
pub async fn stop_transfer(transport: Arc<dyn Transport>, handle: TransferHandle, timeout: Duration) {
    if tokio::time::timeout(timeout, transport.stop(&handle)).await.is_err() {
        warn!(
            "传输层在 {:?} 内没有停止任务 {} (run {}), 不再等待",
            timeout, handle.item_id, handle.run_id
        );
    }
}
