use actix::{Actor, Addr};
use tokio::sync::broadcast;

use super::error::DownloadResult;
use super::manager::DownloadManagerActor;
use super::messages::*;
use super::model::{Device, DownloadItem, EnqueueRequest, GlobalSettings, ItemFilter, ItemId, ItemStatus, Priority};
use super::registry::RegistryChange;
use super::scheduler::QueueStats;

/// 调用方使用的异步接口，可以随意 clone
#[derive(Clone)]
pub struct QueueHandle {
    addr: Addr<DownloadManagerActor>,
}

impl QueueHandle {
    /// 启动调度器 actor，必须在 actix 运行时中调用
    pub fn start(actor: DownloadManagerActor) -> Self {
        Self { addr: actor.start() }
    }

    pub fn addr(&self) -> &Addr<DownloadManagerActor> {
        &self.addr
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> DownloadResult<ItemId> {
        self.addr.send(Enqueue(request)).await?
    }

    pub async fn set_priority(&self, id: ItemId, priority: Priority) -> DownloadResult<()> {
        self.addr.send(SetPriority { id, priority }).await?
    }

    pub async fn pause(&self, id: ItemId) -> DownloadResult<ItemStatus> {
        self.addr.send(Pause { id }).await?
    }

    pub async fn resume(&self, id: ItemId) -> DownloadResult<ItemStatus> {
        self.addr.send(Resume { id }).await?
    }

    pub async fn cancel(&self, id: ItemId) -> DownloadResult<()> {
        self.addr.send(Cancel { id }).await?
    }

    pub async fn remove(&self, id: ItemId) -> DownloadResult<DownloadItem> {
        self.addr.send(Remove { id }).await?
    }

    pub async fn requeue(&self, id: ItemId) -> DownloadResult<()> {
        self.addr.send(Requeue { id }).await?
    }

    pub async fn update_settings(&self, settings: GlobalSettings) -> DownloadResult<()> {
        self.addr.send(UpdateSettings(settings)).await?
    }

    pub async fn register_device(&self, device: Device) -> DownloadResult<()> {
        self.addr.send(RegisterDevice(device)).await?
    }

    pub async fn set_device_online(&self, id: impl Into<String>, online: bool) -> DownloadResult<()> {
        self.addr
            .send(SetDeviceOnline {
                id: id.into(),
                online,
            })
            .await?
    }

    pub async fn list(&self, filter: ItemFilter) -> DownloadResult<Vec<DownloadItem>> {
        Ok(self.addr.send(ListItems(filter)).await?)
    }

    pub async fn get(&self, id: ItemId) -> DownloadResult<DownloadItem> {
        self.addr.send(GetItem { id }).await?
    }

    pub async fn devices(&self) -> DownloadResult<Vec<Device>> {
        Ok(self.addr.send(ListDevices).await?)
    }

    pub async fn settings(&self) -> DownloadResult<GlobalSettings> {
        Ok(self.addr.send(GetSettings).await?)
    }

    pub async fn stats(&self) -> DownloadResult<QueueStats> {
        Ok(self.addr.send(GetStats).await?)
    }

    pub async fn subscribe(&self) -> DownloadResult<broadcast::Receiver<RegistryChange>> {
        Ok(self.addr.send(Subscribe).await?)
    }

    pub async fn shutdown(&self) -> DownloadResult<()> {
        Ok(self.addr.send(Shutdown).await?)
    }
}
