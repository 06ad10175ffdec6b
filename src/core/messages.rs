use actix::Message;
use tokio::sync::broadcast;

use super::error::DownloadResult;
use super::model::{Device, DownloadItem, EnqueueRequest, GlobalSettings, ItemFilter, ItemId, ItemStatus, Priority};
use super::registry::RegistryChange;
use super::scheduler::QueueStats;
use crate::transport::{TransferEvent, TransferHandle};

/// 加入下载队列
pub struct Enqueue(pub EnqueueRequest);
impl Message for Enqueue { type Result = DownloadResult<ItemId>; }

/// 修改优先级
pub struct SetPriority { pub id: ItemId, pub priority: Priority }
impl Message for SetPriority { type Result = DownloadResult<()>; }

/// 暂停任务
pub struct Pause { pub id: ItemId }
impl Message for Pause { type Result = DownloadResult<ItemStatus>; }

/// 恢复任务
pub struct Resume { pub id: ItemId }
impl Message for Resume { type Result = DownloadResult<ItemStatus>; }

/// 取消任务（从队列删除）
pub struct Cancel { pub id: ItemId }
impl Message for Cancel { type Result = DownloadResult<()>; }

/// 删除任意状态的任务
pub struct Remove { pub id: ItemId }
impl Message for Remove { type Result = DownloadResult<DownloadItem>; }

/// 失败任务重新排队
pub struct Requeue { pub id: ItemId }
impl Message for Requeue { type Result = DownloadResult<()>; }

/// 更新全局设置
pub struct UpdateSettings(pub GlobalSettings);
impl Message for UpdateSettings { type Result = DownloadResult<()>; }

pub struct RegisterDevice(pub Device);
impl Message for RegisterDevice { type Result = DownloadResult<()>; }

pub struct SetDeviceOnline { pub id: String, pub online: bool }
impl Message for SetDeviceOnline { type Result = DownloadResult<()>; }

/// 查询任务列表
pub struct ListItems(pub ItemFilter);
impl Message for ListItems { type Result = Vec<DownloadItem>; }

/// 查询单个任务
pub struct GetItem { pub id: ItemId }
impl Message for GetItem { type Result = DownloadResult<DownloadItem>; }

pub struct ListDevices;
impl Message for ListDevices { type Result = Vec<Device>; }

pub struct GetSettings;
impl Message for GetSettings { type Result = GlobalSettings; }

/// 队列统计
pub struct GetStats;
impl Message for GetStats { type Result = QueueStats; }

/// 订阅注册表变更
pub struct Subscribe;
impl Message for Subscribe { type Result = broadcast::Receiver<RegistryChange>; }

/// 暂停所有传输、保存状态并停止调度器
pub struct Shutdown;
impl Message for Shutdown { type Result = (); }

/// 内部：worker 回报传输事件
pub struct TransferReport {
    pub handle: TransferHandle,
    pub event: TransferEvent,
}
impl Message for TransferReport { type Result = (); }
