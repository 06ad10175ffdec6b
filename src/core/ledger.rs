//! 存储账本：记录每台设备的容量、预留和已提交的占用，负责存储准入

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::model::{Device, DeviceId, ItemId};

/// 账本中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub item_id: ItemId,
    pub device_id: DeviceId,
    pub bytes: u64,
    pub committed: bool,
}

#[derive(Debug, Clone, Default)]
struct DeviceAccount {
    capacity: u64,
    /// 注册时设备上已有的占用
    baseline: u64,
    /// 下载中/暂停任务的临时预留
    reserved: HashMap<ItemId, u64>,
    /// 已完成任务的实际占用
    committed: HashMap<ItemId, u64>,
}

impl DeviceAccount {
    fn used(&self) -> u64 {
        let reserved: u64 = self.reserved.values().sum();
        let committed: u64 = self.committed.values().sum();
        self.baseline.saturating_add(reserved).saturating_add(committed)
    }
}

/// 阈值换算：capacity * percent / 100
pub fn threshold_bytes(capacity: u64, percent: u8) -> u64 {
    (capacity as u128 * percent.min(100) as u128 / 100) as u64
}

#[derive(Debug, Default)]
pub struct StorageLedger {
    accounts: HashMap<DeviceId, DeviceAccount>,
    /// 任务 -> 持有预留或占用的设备
    owners: HashMap<ItemId, DeviceId>,
}

impl StorageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device: &Device) {
        let account = self.accounts.entry(device.id.clone()).or_default();
        account.capacity = device.storage_capacity_bytes;
        account.baseline = device.used_storage_bytes;
    }

    pub fn used(&self, device_id: &str) -> u64 {
        self.accounts.get(device_id).map(|a| a.used()).unwrap_or(0)
    }

    /// 阈值以内还能准入的字节数
    pub fn available(&self, device_id: &str, threshold_percent: u8) -> u64 {
        match self.accounts.get(device_id) {
            Some(account) => threshold_bytes(account.capacity, threshold_percent).saturating_sub(account.used()),
            None => 0,
        }
    }

    /// 准入检查：used + bytes 超过 capacity * threshold 时拒绝。
    /// 同一任务在同一设备上重复预留视为成功。
    pub fn reserve(&mut self, device_id: &str, item: ItemId, bytes: u64, threshold_percent: u8) -> bool {
        if let Some(owner) = self.owners.get(&item) {
            return owner == device_id;
        }
        let Some(account) = self.accounts.get_mut(device_id) else {
            return false;
        };
        let limit = threshold_bytes(account.capacity, threshold_percent);
        if account.used().saturating_add(bytes) > limit {
            debug!(
                "设备 {} 存储准入失败: 已用 {} + 申请 {} > 阈值 {}",
                device_id,
                account.used(),
                bytes,
                limit
            );
            return false;
        }
        account.reserved.insert(item, bytes);
        self.owners.insert(item, device_id.to_string());
        true
    }

    /// 调整已有预留的大小（传输层报告真实大小后），超过阈值时保持原预留并返回 false
    pub fn resize(&mut self, item: ItemId, bytes: u64, threshold_percent: u8) -> bool {
        let Some(device_id) = self.owners.get(&item) else {
            return false;
        };
        let Some(account) = self.accounts.get_mut(device_id) else {
            return false;
        };
        let Some(current) = account.reserved.get(&item).copied() else {
            return false;
        };
        let limit = threshold_bytes(account.capacity, threshold_percent);
        let projected = account.used() - current + bytes;
        if bytes > current && projected > limit {
            return false;
        }
        account.reserved.insert(item, bytes);
        true
    }

    /// 完成时把预留修正为实际写入的大小
    pub fn commit(&mut self, item: ItemId, actual_bytes: u64) -> Option<DeviceId> {
        let device_id = self.owners.get(&item)?.clone();
        let account = self.accounts.get_mut(&device_id)?;
        if account.reserved.remove(&item).is_none() {
            warn!("任务 {} 在设备 {} 上没有预留, 直接记录占用", item, device_id);
        }
        account.committed.insert(item, actual_bytes);
        Some(device_id)
    }

    /// 释放临时预留，返回释放的字节数；已提交的占用不受影响
    pub fn release(&mut self, item: ItemId) -> u64 {
        let Some(device_id) = self.owners.get(&item).cloned() else {
            return 0;
        };
        let Some(account) = self.accounts.get_mut(&device_id) else {
            return 0;
        };
        match account.reserved.remove(&item) {
            Some(bytes) => {
                self.owners.remove(&item);
                bytes
            }
            None => 0,
        }
    }

    /// 删除已完成任务时归还其占用
    pub fn forget(&mut self, item: ItemId) -> u64 {
        let released = self.release(item);
        let Some(device_id) = self.owners.remove(&item) else {
            return released;
        };
        let committed = self
            .accounts
            .get_mut(&device_id)
            .and_then(|a| a.committed.remove(&item))
            .unwrap_or(0);
        released + committed
    }

    pub fn reservation(&self, item: ItemId) -> Option<(&DeviceId, u64)> {
        let device_id = self.owners.get(&item)?;
        let bytes = self.accounts.get(device_id)?.reserved.get(&item)?;
        Some((device_id, *bytes))
    }

    /// 导出所有预留和占用，用于持久化
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries = Vec::new();
        for (device_id, account) in &self.accounts {
            for (item, bytes) in &account.reserved {
                entries.push(LedgerEntry {
                    item_id: *item,
                    device_id: device_id.clone(),
                    bytes: *bytes,
                    committed: false,
                });
            }
            for (item, bytes) in &account.committed {
                entries.push(LedgerEntry {
                    item_id: *item,
                    device_id: device_id.clone(),
                    bytes: *bytes,
                    committed: true,
                });
            }
        }
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.item_id.cmp(&b.item_id)));
        entries
    }

    /// 从持久化状态恢复预留（不做准入检查）
    pub fn restore_reservation(&mut self, device_id: &str, item: ItemId, bytes: u64) {
        if let Some(account) = self.accounts.get_mut(device_id) {
            account.reserved.insert(item, bytes);
            self.owners.insert(item, device_id.to_string());
        }
    }

    pub fn restore_committed(&mut self, device_id: &str, item: ItemId, bytes: u64) {
        if let Some(account) = self.accounts.get_mut(device_id) {
            account.committed.insert(item, bytes);
            self.owners.insert(item, device_id.to_string());
        }
    }
}
