//! 下载注册表：所有任务和设备的唯一数据来源。
//!
//! 只有调度器持有可变引用；每次修改都会在 broadcast 通道上发布一条
//! [`RegistryChange`]，外部无需轮询。

use std::collections::HashMap;

use log::debug;
use tokio::sync::broadcast;

use super::error::{DownloadError, DownloadResult};
use super::model::{Device, DeviceId, DownloadItem, EnqueueRequest, ItemFilter, ItemId, ItemStatus, Priority};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// 注册表变更通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    ItemCreated(ItemId),
    StatusChanged { id: ItemId, status: ItemStatus },
    PriorityChanged { id: ItemId, priority: Priority },
    ItemRemoved(ItemId),
    DeviceRegistered(DeviceId),
    DeviceOnlineChanged { id: DeviceId, online: bool },
}

pub struct DownloadRegistry {
    items: HashMap<ItemId, DownloadItem>,
    devices: HashMap<DeviceId, Device>,
    next_sequence: u64,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for DownloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            items: HashMap::new(),
            devices: HashMap::new(),
            next_sequence: 0,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: RegistryChange) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.changes.send(change);
    }

    pub fn create(&mut self, request: EnqueueRequest) -> ItemId {
        let item = DownloadItem::new(request, self.next_sequence);
        self.next_sequence += 1;
        let id = item.id;
        debug!("注册任务 {} ({})", id, item.title);
        self.items.insert(id, item);
        self.publish(RegistryChange::ItemCreated(id));
        id
    }

    /// 从持久化状态恢复任务，保持原来的入队顺序
    pub fn restore(&mut self, item: DownloadItem) {
        self.next_sequence = self.next_sequence.max(item.sequence + 1);
        let id = item.id;
        self.items.insert(id, item);
        self.publish(RegistryChange::ItemCreated(id));
    }

    pub fn get(&self, id: ItemId) -> Option<&DownloadItem> {
        self.items.get(&id)
    }

    pub fn require(&self, id: ItemId) -> DownloadResult<&DownloadItem> {
        self.items.get(&id).ok_or(DownloadError::ItemNotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: ItemId) -> Option<&mut DownloadItem> {
        self.items.get_mut(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &DownloadItem> {
        self.items.values()
    }

    /// 按入队顺序返回快照
    pub fn list(&self, filter: &ItemFilter) -> Vec<DownloadItem> {
        let mut items: Vec<DownloadItem> = self.items.values().filter(|i| filter.matches(i)).cloned().collect();
        items.sort_by_key(|i| i.sequence);
        items
    }

    pub fn update_priority(&mut self, id: ItemId, priority: Priority) -> DownloadResult<()> {
        let item = self.items.get_mut(&id).ok_or(DownloadError::ItemNotFound(id))?;
        if item.priority != priority {
            item.priority = priority;
            self.publish(RegistryChange::PriorityChanged { id, priority });
        }
        Ok(())
    }

    pub fn set_status(&mut self, id: ItemId, status: ItemStatus) {
        if let Some(item) = self.items.get_mut(&id) {
            if item.status != status {
                item.set_status(status);
                self.publish(RegistryChange::StatusChanged { id, status });
            }
        }
    }

    /// 累加进度，大小已知时不超过 size_bytes；返回新的进度
    pub fn record_progress(&mut self, id: ItemId, delta: u64) -> Option<u64> {
        let item = self.items.get_mut(&id)?;
        let mut progress = item.progress_bytes.saturating_add(delta);
        if let Some(size) = item.size_bytes {
            progress = progress.min(size);
        }
        item.progress_bytes = progress;
        Some(progress)
    }

    pub fn remove(&mut self, id: ItemId) -> Option<DownloadItem> {
        let removed = self.items.remove(&id);
        if removed.is_some() {
            self.publish(RegistryChange::ItemRemoved(id));
        }
        removed
    }

    pub fn register_device(&mut self, device: Device) -> DownloadResult<()> {
        if self.devices.contains_key(&device.id) {
            return Err(DownloadError::DeviceExists(device.id));
        }
        let id = device.id.clone();
        self.devices.insert(id.clone(), device);
        self.publish(RegistryChange::DeviceRegistered(id));
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// 设备按 id 排序，保证调度结果可复现
    pub fn devices(&self) -> Vec<&Device> {
        let mut devices: Vec<&Device> = self.devices.values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// 返回状态是否真的发生了变化
    pub fn set_device_online(&mut self, id: &str, online: bool) -> DownloadResult<bool> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| DownloadError::DeviceNotFound(id.to_string()))?;
        if device.is_online == online {
            return Ok(false);
        }
        device.is_online = online;
        self.publish(RegistryChange::DeviceOnlineChanged {
            id: id.to_string(),
            online,
        });
        Ok(true)
    }
}
