//! 带宽分配器
//!
//! 三层限制：
//! - 全局：在线设备总带宽 * global_bandwidth_limit_percent
//! - 设备：每台设备自身的 bandwidth_capacity_bytes_per_sec
//! - 任务：每个已准入任务至少获得 min_item_bandwidth
//!
//! 保底之外的带宽按优先级分层做 max-min 公平分配，高优先级层用不完的
//! （受设备上限约束的）部分顺延给下一层。

use std::collections::{HashMap, HashSet};

use super::model::{Device, DeviceId, ItemId, Priority};

/// 一个正在下载的任务在分配器眼中的样子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTransfer {
    pub id: ItemId,
    pub device_id: DeviceId,
    pub priority: Priority,
    pub sequence: u64,
}

/// 一轮调度开始时计算出的带宽预算
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandwidthBudget {
    pub global: u64,
    pub devices: HashMap<DeviceId, u64>,
}

impl BandwidthBudget {
    /// 只统计在线设备
    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a Device>, limit_percent: u8) -> Self {
        let devices: HashMap<DeviceId, u64> = devices
            .into_iter()
            .filter(|d| d.is_online)
            .map(|d| (d.id.clone(), d.bandwidth_capacity_bytes_per_sec))
            .collect();
        let total: u128 = devices.values().map(|c| *c as u128).sum();
        let global = (total * limit_percent.min(100) as u128 / 100) as u64;
        Self { global, devices }
    }

    pub fn device(&self, device_id: &str) -> Option<u64> {
        self.devices.get(device_id).copied()
    }
}

#[derive(Debug, Clone)]
pub struct BandwidthAllocator {
    min_item_bandwidth: u64,
}

impl BandwidthAllocator {
    pub fn new(min_item_bandwidth: u64) -> Self {
        Self {
            min_item_bandwidth: min_item_bandwidth.max(1),
        }
    }

    pub fn min_item_bandwidth(&self) -> u64 {
        self.min_item_bandwidth
    }

    /// 准入：新任务加入后，设备和全局预算仍能给每个任务保底带宽
    pub fn admit(&self, budget: &BandwidthBudget, device_id: &str, active: &[ActiveTransfer]) -> bool {
        let Some(capacity) = budget.device(device_id) else {
            return false;
        };
        let on_device = active.iter().filter(|t| t.device_id == device_id).count() as u64 + 1;
        let total = active.len() as u64 + 1;
        self.min_item_bandwidth.saturating_mul(on_device) <= capacity
            && self.min_item_bandwidth.saturating_mul(total) <= budget.global
    }

    /// 当前的活动集合能否全部满足保底带宽（设置收紧后用来判断是否需要抢占）
    pub fn is_feasible(&self, budget: &BandwidthBudget, active: &[ActiveTransfer]) -> bool {
        !self.exceeds_global(budget, active) && self.overloaded_devices(budget, active).is_empty()
    }

    pub fn exceeds_global(&self, budget: &BandwidthBudget, active: &[ActiveTransfer]) -> bool {
        self.min_item_bandwidth.saturating_mul(active.len() as u64) > budget.global
    }

    /// 放不下保底带宽的设备，不在预算里的设备（离线）也算
    pub fn overloaded_devices(&self, budget: &BandwidthBudget, active: &[ActiveTransfer]) -> HashSet<DeviceId> {
        let mut per_device: HashMap<&str, u64> = HashMap::new();
        for transfer in active {
            *per_device.entry(transfer.device_id.as_str()).or_default() += 1;
        }
        per_device
            .into_iter()
            .filter(|(device_id, count)| match budget.device(device_id) {
                Some(capacity) => self.min_item_bandwidth.saturating_mul(*count) > capacity,
                None => true,
            })
            .map(|(device_id, _)| device_id.to_string())
            .collect()
    }

    /// 重新分配所有活动任务的带宽
    pub fn redistribute(&self, budget: &BandwidthBudget, active: &[ActiveTransfer]) -> HashMap<ItemId, u64> {
        let mut order: Vec<&ActiveTransfer> = active.iter().collect();
        order.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));

        let mut allocation: HashMap<ItemId, u64> = order.iter().map(|t| (t.id, 0)).collect();
        let mut device_left = budget.devices.clone();
        let mut global_left = budget.global;

        // 保底
        for transfer in &order {
            let Some(left) = device_left.get_mut(&transfer.device_id) else {
                continue;
            };
            let grant = self.min_item_bandwidth.min(*left).min(global_left);
            *left -= grant;
            global_left -= grant;
            if let Some(slot) = allocation.get_mut(&transfer.id) {
                *slot += grant;
            }
        }

        for tier in Priority::TIERS {
            let members: Vec<&ActiveTransfer> = order
                .iter()
                .copied()
                .filter(|t| t.priority == tier && device_left.contains_key(&t.device_id))
                .collect();
            global_left = Self::fill_tier(members, &mut device_left, global_left, &mut allocation);
            if global_left == 0 {
                break;
            }
        }

        allocation
    }

    /// 在一个优先级层内做 water-filling，返回剩余的全局带宽
    fn fill_tier(
        mut unsatisfied: Vec<&ActiveTransfer>,
        device_left: &mut HashMap<DeviceId, u64>,
        mut global_left: u64,
        allocation: &mut HashMap<ItemId, u64>,
    ) -> u64 {
        while !unsatisfied.is_empty() && global_left > 0 {
            let share = global_left / unsatisfied.len() as u64;
            if share == 0 {
                break;
            }

            let mut counts: HashMap<&str, u64> = HashMap::new();
            for transfer in &unsatisfied {
                *counts.entry(transfer.device_id.as_str()).or_default() += 1;
            }
            let limited: Vec<String> = counts
                .iter()
                .filter(|(device_id, count)| {
                    let left = device_left.get(**device_id).copied().unwrap_or(0);
                    share.saturating_mul(**count) > left
                })
                .map(|(device_id, _)| device_id.to_string())
                .collect();

            if limited.is_empty() {
                for transfer in &unsatisfied {
                    if let Some(left) = device_left.get_mut(&transfer.device_id) {
                        *left -= share;
                    }
                    if let Some(slot) = allocation.get_mut(&transfer.id) {
                        *slot += share;
                    }
                    global_left -= share;
                }
                break;
            }

            // 受设备上限约束的任务平分设备剩余带宽后退出本层
            for device_id in &limited {
                let count = counts.get(device_id.as_str()).copied().unwrap_or(1);
                let left = device_left.get(device_id).copied().unwrap_or(0);
                let each = left / count;
                for transfer in unsatisfied.iter().filter(|t| &t.device_id == device_id) {
                    if let Some(slot) = allocation.get_mut(&transfer.id) {
                        *slot += each;
                    }
                }
                let given = each * count;
                if let Some(slot) = device_left.get_mut(device_id) {
                    *slot -= given;
                }
                global_left -= given;
            }
            unsatisfied.retain(|t| !limited.contains(&t.device_id));
        }
        global_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn transfer(device: &str, priority: Priority, sequence: u64) -> ActiveTransfer {
        ActiveTransfer {
            id: Uuid::new_v4(),
            device_id: device.to_string(),
            priority,
            sequence,
        }
    }

    fn budget(devices: &[Device], percent: u8) -> BandwidthBudget {
        BandwidthBudget::from_devices(devices.iter(), percent)
    }

    #[test]
    fn test_budget_ignores_offline_devices() {
        let mut offline = Device::new("b", 1, 500);
        offline.is_online = false;
        let b = budget(&[Device::new("a", 1, 1000), offline], 50);
        assert_eq!(b.global, 500);
        assert!(b.device("b").is_none());
    }

    #[test]
    fn test_equal_split_within_tier() {
        let allocator = BandwidthAllocator::new(1);
        let b = budget(&[Device::new("a", 1, 300)], 100);
        let active: Vec<_> = (0..3).map(|i| transfer("a", Priority::Normal, i)).collect();
        let allocation = allocator.redistribute(&b, &active);
        for t in &active {
            assert_eq!(allocation[&t.id], 100);
        }
    }

    #[test]
    fn test_device_limited_remainder_rolls_forward() {
        let allocator = BandwidthAllocator::new(10);
        let b = budget(&[Device::new("a", 1, 100), Device::new("b", 1, 1000)], 100);
        let high_a = transfer("a", Priority::High, 0);
        let high_b = transfer("b", Priority::High, 1);
        let low_b = transfer("b", Priority::Low, 2);
        let active = vec![high_a.clone(), high_b.clone(), low_b.clone()];

        let allocation = allocator.redistribute(&b, &active);
        assert_eq!(allocation[&high_a.id], 100);
        assert_eq!(allocation[&high_b.id], 990);
        // 低优先级只拿到保底，但不为零
        assert_eq!(allocation[&low_b.id], 10);
        let total: u64 = allocation.values().sum();
        assert!(total <= b.global);
    }

    #[test]
    fn test_global_limit_respected() {
        let allocator = BandwidthAllocator::new(1);
        let b = budget(&[Device::new("a", 1, 1000), Device::new("b", 1, 1000)], 25);
        let active = vec![transfer("a", Priority::Normal, 0), transfer("b", Priority::Normal, 1)];
        let allocation = allocator.redistribute(&b, &active);
        let total: u64 = allocation.values().sum();
        assert_eq!(total, 500);
        assert!(allocation.values().all(|v| *v == 250));
    }

    #[test]
    fn test_high_priority_not_throttled_by_low() {
        let allocator = BandwidthAllocator::new(5);
        let b = budget(&[Device::new("a", 1, 100)], 100);
        let high = transfer("a", Priority::High, 5);
        let lows: Vec<_> = (0..4).map(|i| transfer("a", Priority::Low, i)).collect();
        let mut active = lows.clone();
        active.push(high.clone());

        let allocation = allocator.redistribute(&b, &active);
        // 公平份额是 100 / 5 = 20，高优先级不应低于它
        assert!(allocation[&high.id] >= 20);
        assert!(lows.iter().all(|t| allocation[&t.id] > 0));
    }

    #[test]
    fn test_admit_respects_floor() {
        let allocator = BandwidthAllocator::new(100);
        let b = budget(&[Device::new("a", 1, 250)], 100);
        let mut active = Vec::new();
        assert!(allocator.admit(&b, "a", &active));
        active.push(transfer("a", Priority::Normal, 0));
        assert!(allocator.admit(&b, "a", &active));
        active.push(transfer("a", Priority::Normal, 1));
        assert!(!allocator.admit(&b, "a", &active));
        assert!(!allocator.admit(&b, "missing", &[]));
        assert!(allocator.is_feasible(&b, &active));
    }

    #[test]
    fn test_feasibility_after_limit_drops() {
        let allocator = BandwidthAllocator::new(100);
        let active = vec![transfer("a", Priority::Normal, 0), transfer("a", Priority::Normal, 1)];
        let tight = budget(&[Device::new("a", 1, 1000)], 10);
        assert!(!allocator.is_feasible(&tight, &active));
        assert!(allocator.exceeds_global(&tight, &active));
        assert!(allocator.overloaded_devices(&tight, &active).is_empty());

        let small_device = budget(&[Device::new("a", 1, 150), Device::new("b", 1, 1000)], 100);
        assert!(!allocator.exceeds_global(&small_device, &active));
        let overloaded = allocator.overloaded_devices(&small_device, &active);
        assert_eq!(overloaded.len(), 1);
        assert!(overloaded.contains("a"));

        // 离线设备不在预算里
        let offline = budget(&[Device::new("b", 1, 1000)], 100);
        assert!(allocator.overloaded_devices(&offline, &active).contains("a"));
    }
}
