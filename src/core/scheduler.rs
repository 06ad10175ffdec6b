//! 调度核心
//!
//! 一轮调度（`schedule`）依次完成：
//! 1. 统计在线设备的带宽预算
//! 2. 把设备已离线的下载任务转为暂停（保留存储预留）
//! 3. 设置收紧后抢占超出限制的任务
//! 4. 计算空闲槽位，按 优先级 > 大小(智能队列) > 入队顺序 挑选候选
//! 5. 逐个做存储和带宽准入，通过的任务开始下载
//! 6. 对所有下载中的任务重新分配带宽
//!
//! 核心本身是同步的、不持有任何运行时资源：需要对传输层做的事情以
//! [`Command`] 形式写入 outbox，由外层 actor 执行。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;

use super::bandwidth::{ActiveTransfer, BandwidthAllocator, BandwidthBudget};
use super::error::{AdmissionDenial, DownloadError, DownloadResult, TransportError};
use super::ledger::StorageLedger;
use super::model::{
    Device, DeviceId, DownloadItem, EnqueueRequest, GlobalSettings, ItemFilter, ItemId, ItemStatus, PauseReason,
    Priority,
};
use super::registry::{DownloadRegistry, RegistryChange};
use super::retry::{RetryDecision, RetryStrategy};
use super::sink::{DownloadEvent, EventKind};
use super::speed::SpeedMeter;
use super::store::{QueueSnapshot, SNAPSHOT_VERSION};
use crate::transport::{TransferHandle, TransferRequest};
use crate::utils::validator::validate_url;

/// 一轮调度使用的时间：单调时钟用于退避，本地时间用于时间窗口
#[derive(Debug, Clone, Copy)]
pub struct PassClock {
    pub now: Instant,
    pub local: NaiveTime,
}

impl PassClock {
    pub fn current() -> Self {
        Self {
            now: Instant::now(),
            local: Local::now().time(),
        }
    }

    pub fn at(now: Instant, local: NaiveTime) -> Self {
        Self { now, local }
    }
}

/// 调度器发给传输层的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { request: TransferRequest, bandwidth: u64 },
    Stop(TransferHandle),
    SetBandwidth { handle: TransferHandle, bytes_per_sec: u64 },
    /// 退避结束后再跑一轮
    WakeAfter(Duration),
}

#[derive(Debug, Default)]
pub struct Outbox {
    pub commands: Vec<Command>,
    pub events: Vec<DownloadEvent>,
    /// 状态有变化，需要持久化
    pub dirty: bool,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && !self.dirty
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub retry: RetryStrategy,
    /// 大小未知时的临时存储预留
    pub unknown_size_reservation: u64,
    /// 每个已准入任务的最低带宽
    pub min_item_bandwidth: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            retry: RetryStrategy::default(),
            unknown_size_reservation: 100 * 1024 * 1024,
            min_item_bandwidth: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub id: DeviceId,
    pub name: String,
    pub is_online: bool,
    pub storage_capacity_bytes: u64,
    pub used_storage_bytes: u64,
    /// 存储阈值以内的剩余空间
    pub free_storage_bytes: u64,
    pub bandwidth_capacity_bytes_per_sec: u64,
    /// capacity - Σ 正在下载任务的速度
    pub free_bandwidth_bytes_per_sec: u64,
    pub active_downloads: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub error: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub devices: Vec<DeviceStats>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.downloading + self.paused + self.completed + self.error
    }

    /// 所有任务都已完成或失败
    pub fn all_terminal(&self) -> bool {
        self.queued + self.downloading + self.paused == 0
    }
}

/// 候选排序：优先级高的在前；开启智能队列时小文件在前（大小未知排最后）；最后按入队顺序
pub fn compare_candidates(a: &DownloadItem, b: &DownloadItem, smart_queue: bool) -> Ordering {
    let size_key = |item: &DownloadItem| (item.size_bytes.is_none(), item.size_bytes.unwrap_or(0));
    b.priority
        .cmp(&a.priority)
        .then_with(|| {
            if smart_queue {
                size_key(a).cmp(&size_key(b))
            } else {
                Ordering::Equal
            }
        })
        .then(a.sequence.cmp(&b.sequence))
}

fn event_for(item: &DownloadItem, kind: EventKind) -> DownloadEvent {
    DownloadEvent {
        item_id: item.id,
        title: item.title.clone(),
        status: item.status,
        snapshot: item.snapshot(),
        kind,
    }
}

pub struct SchedulerCore {
    registry: DownloadRegistry,
    ledger: StorageLedger,
    allocator: BandwidthAllocator,
    settings: GlobalSettings,
    options: SchedulerOptions,
    /// 下载中任务的当前 run id
    runs: HashMap<ItemId, u64>,
    next_run: u64,
    /// 失败后的退避截止时间
    backoff: HashMap<ItemId, Instant>,
    /// 最近一次准入失败的原因，原因变化时才通知
    denials: HashMap<ItemId, AdmissionDenial>,
    meters: HashMap<ItemId, SpeedMeter>,
    /// 大小未知的任务至少需要的字节数（曾经写到过的进度）
    size_floors: HashMap<ItemId, u64>,
    outbox: Outbox,
}

impl SchedulerCore {
    pub fn new(settings: GlobalSettings, options: SchedulerOptions) -> DownloadResult<Self> {
        settings.validate()?;
        Ok(Self {
            registry: DownloadRegistry::new(),
            ledger: StorageLedger::new(),
            allocator: BandwidthAllocator::new(options.min_item_bandwidth),
            settings,
            options,
            runs: HashMap::new(),
            next_run: 0,
            backoff: HashMap::new(),
            denials: HashMap::new(),
            meters: HashMap::new(),
            size_floors: HashMap::new(),
            outbox: Outbox::default(),
        })
    }

    /// 从快照恢复：下载中的任务转为暂停（重启后自动恢复），并重建存储账本
    pub fn from_snapshot(snapshot: QueueSnapshot, options: SchedulerOptions) -> DownloadResult<Self> {
        let mut core = Self::new(snapshot.settings, options)?;
        for device in snapshot.devices {
            core.ledger.register(&device);
            core.registry.register_device(device)?;
        }
        for mut item in snapshot.items {
            if item.status == ItemStatus::Downloading {
                item.status = ItemStatus::Paused;
                item.pause_reason = Some(PauseReason::Restart);
            }
            item.clear_rates();
            core.registry.restore(item);
        }
        for entry in snapshot.ledger {
            let Some(item) = core.registry.get(entry.item_id) else {
                warn!("账本记录 {} 对应的任务不存在, 已忽略", entry.item_id);
                continue;
            };
            match (entry.committed, item.status) {
                (true, ItemStatus::Completed) => {
                    core.ledger.restore_committed(&entry.device_id, entry.item_id, entry.bytes)
                }
                (false, ItemStatus::Paused) => {
                    core.ledger.restore_reservation(&entry.device_id, entry.item_id, entry.bytes)
                }
                _ => debug!("忽略任务 {} 的过期账本记录", entry.item_id),
            }
        }
        Ok(core)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            settings: self.settings.clone(),
            devices: self.registry.devices().into_iter().cloned().collect(),
            items: self.registry.list(&ItemFilter::all()),
            ledger: self.ledger.entries(),
        }
    }

    pub fn take_outbox(&mut self) -> Outbox {
        std::mem::take(&mut self.outbox)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.registry.subscribe()
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn get(&self, id: ItemId) -> DownloadResult<DownloadItem> {
        self.registry.require(id).cloned()
    }

    pub fn list(&self, filter: &ItemFilter) -> Vec<DownloadItem> {
        self.registry.list(filter)
    }

    /// 设备视图，used_storage_bytes 包含预留和已完成任务的占用
    pub fn devices(&self) -> Vec<Device> {
        self.registry
            .devices()
            .into_iter()
            .map(|d| {
                let mut device = d.clone();
                device.used_storage_bytes = self.ledger.used(&d.id);
                device
            })
            .collect()
    }

    pub fn has_active(&self) -> bool {
        !self.runs.is_empty()
    }

    /// 当前 run 的句柄
    pub fn handle(&self, id: ItemId) -> Option<TransferHandle> {
        self.runs.get(&id).map(|run_id| TransferHandle {
            item_id: id,
            run_id: *run_id,
        })
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for item in self.registry.items() {
            match item.status {
                ItemStatus::Queued => stats.queued += 1,
                ItemStatus::Downloading => stats.downloading += 1,
                ItemStatus::Paused => stats.paused += 1,
                ItemStatus::Completed => stats.completed += 1,
                ItemStatus::Error => stats.error += 1,
            }
            stats.total_bytes += item.size_bytes.unwrap_or(0);
            stats.downloaded_bytes += item.progress_bytes;
            stats.speed_bytes_per_sec += item.speed_bytes_per_sec;
        }

        let threshold = self.settings.storage_threshold_percent;
        for device in self.registry.devices() {
            let active: Vec<&DownloadItem> = self
                .registry
                .items()
                .filter(|i| i.status == ItemStatus::Downloading)
                .filter(|i| i.assigned_device_id.as_deref() == Some(device.id.as_str()))
                .collect();
            let speed: u64 = active.iter().map(|i| i.speed_bytes_per_sec).sum();
            stats.devices.push(DeviceStats {
                id: device.id.clone(),
                name: device.name.clone(),
                is_online: device.is_online,
                storage_capacity_bytes: device.storage_capacity_bytes,
                used_storage_bytes: self.ledger.used(&device.id),
                free_storage_bytes: self.ledger.available(&device.id, threshold),
                bandwidth_capacity_bytes_per_sec: device.bandwidth_capacity_bytes_per_sec,
                free_bandwidth_bytes_per_sec: device.bandwidth_capacity_bytes_per_sec.saturating_sub(speed),
                active_downloads: active.len(),
            });
        }
        stats
    }

    // ---- 调用方接口 ----

    pub fn enqueue(&mut self, request: EnqueueRequest, clock: PassClock) -> DownloadResult<ItemId> {
        validate_url(&request.url)?;
        if let Some(device_id) = &request.device_id {
            if self.registry.device(device_id).is_none() {
                return Err(DownloadError::DeviceNotFound(device_id.clone()));
            }
        }
        let id = self.registry.create(request);
        self.outbox.dirty = true;
        self.emit(id, EventKind::Enqueued);
        self.schedule(clock);
        Ok(id)
    }

    pub fn set_priority(&mut self, id: ItemId, priority: Priority, clock: PassClock) -> DownloadResult<()> {
        self.registry.update_priority(id, priority)?;
        self.outbox.dirty = true;
        self.schedule(clock);
        Ok(())
    }

    /// 暂停：下载中的任务停止传输但保留存储预留；排队中的任务被挂起；
    /// 已暂停的任务原样返回
    pub fn pause(&mut self, id: ItemId, clock: PassClock) -> DownloadResult<ItemStatus> {
        let item = self.registry.require(id)?;
        let (status, reason) = (item.status, item.pause_reason);
        match status {
            ItemStatus::Paused => {
                if reason != Some(PauseReason::User) {
                    // 用户接管后不再自动恢复
                    if let Some(item) = self.registry.get_mut(id) {
                        item.pause_reason = Some(PauseReason::User);
                    }
                    self.outbox.dirty = true;
                }
            }
            ItemStatus::Queued => {
                self.backoff.remove(&id);
                self.hold(id, PauseReason::User);
            }
            ItemStatus::Downloading => {
                self.stop_transfer(id);
                self.hold(id, PauseReason::User);
                self.schedule(clock);
            }
            status => return Err(DownloadError::invalid_transition(id, status, "pause")),
        }
        Ok(ItemStatus::Paused)
    }

    /// 恢复：标记为待恢复并立即调度一轮；未获准入时任务保持暂停并留在候选中
    pub fn resume(&mut self, id: ItemId, clock: PassClock) -> DownloadResult<ItemStatus> {
        let status = self.registry.require(id)?.status;
        match status {
            ItemStatus::Downloading | ItemStatus::Queued => return Ok(status),
            ItemStatus::Paused => {}
            status => return Err(DownloadError::invalid_transition(id, status, "resume")),
        }
        if let Some(item) = self.registry.get_mut(id) {
            item.pause_reason = Some(PauseReason::ResumeRequested);
        }
        self.outbox.dirty = true;
        self.schedule(clock);

        match self.registry.require(id)?.status {
            ItemStatus::Downloading => Ok(ItemStatus::Downloading),
            _ => Err(DownloadError::AdmissionDenied(
                self.denials.get(&id).cloned().unwrap_or(AdmissionDenial::Deferred),
            )),
        }
    }

    /// 取消：停止传输、释放预留并从注册表删除
    pub fn cancel(&mut self, id: ItemId, clock: PassClock) -> DownloadResult<()> {
        let status = self.registry.require(id)?.status;
        if status.is_terminal() {
            return Err(DownloadError::invalid_transition(id, status, "cancel"));
        }
        self.discard(id, false);
        self.schedule(clock);
        Ok(())
    }

    /// 删除任意状态的任务；已完成任务的占用一并归还
    pub fn remove(&mut self, id: ItemId, clock: PassClock) -> DownloadResult<DownloadItem> {
        self.registry.require(id)?;
        let removed = self.discard(id, true).ok_or(DownloadError::ItemNotFound(id))?;
        self.schedule(clock);
        Ok(removed)
    }

    /// 失败的任务重新排队，重试次数和进度清零
    pub fn requeue(&mut self, id: ItemId, clock: PassClock) -> DownloadResult<()> {
        let status = self.registry.require(id)?.status;
        if status != ItemStatus::Error {
            return Err(DownloadError::invalid_transition(id, status, "requeue"));
        }
        if let Some(item) = self.registry.get_mut(id) {
            item.attempts = 0;
            item.progress_bytes = 0;
            item.last_error = None;
            item.pause_reason = None;
            item.clear_rates();
        }
        self.backoff.remove(&id);
        self.transition(id, ItemStatus::Queued);
        self.schedule(clock);
        Ok(())
    }

    pub fn update_settings(&mut self, settings: GlobalSettings, clock: PassClock) -> DownloadResult<()> {
        settings.validate()?;
        info!(
            "更新全局设置: 并发 {}, 带宽 {}%, 存储阈值 {}%, 智能队列 {}",
            settings.max_concurrent_downloads,
            settings.global_bandwidth_limit_percent,
            settings.storage_threshold_percent,
            settings.smart_queue_enabled
        );
        self.settings = settings;
        self.outbox.dirty = true;
        self.schedule(clock);
        Ok(())
    }

    pub fn register_device(&mut self, device: Device, clock: PassClock) -> DownloadResult<()> {
        if device.used_storage_bytes > device.storage_capacity_bytes {
            return Err(DownloadError::invalid_config(format!(
                "设备 {} 的已用空间超过容量",
                device.id
            )));
        }
        info!("注册设备 {} ({})", device.id, device.name);
        self.registry.register_device(device.clone())?;
        self.ledger.register(&device);
        self.outbox.dirty = true;
        self.schedule(clock);
        Ok(())
    }

    pub fn set_device_online(&mut self, id: &str, online: bool, clock: PassClock) -> DownloadResult<()> {
        if self.registry.set_device_online(id, online)? {
            info!("设备 {} {}", id, if online { "上线" } else { "离线" });
            self.outbox.dirty = true;
            if !online {
                self.evict_offline();
            }
        }
        self.schedule(clock);
        Ok(())
    }

    /// 停止所有传输，下载中的任务转为暂停，重启后自动恢复
    pub fn shutdown(&mut self) {
        let active: Vec<ItemId> = self.runs.keys().copied().collect();
        for id in active {
            self.stop_transfer(id);
            self.hold(id, PauseReason::Restart);
        }
    }

    // ---- 传输层回报 ----

    fn is_current(&self, handle: &TransferHandle) -> bool {
        self.runs.get(&handle.item_id) == Some(&handle.run_id)
    }

    pub fn on_progress(&mut self, handle: TransferHandle, delta: u64, clock: PassClock) {
        if !self.is_current(&handle) {
            return;
        }
        let id = handle.item_id;
        let Some(progress) = self.registry.record_progress(id, delta) else {
            return;
        };
        if !self.cover_unknown_size(id, progress, clock) {
            return;
        }
        let now = clock.now;
        let meter = self.meters.entry(id).or_insert_with(|| SpeedMeter::new(now));
        meter.record(delta, now);
        let speed = meter.speed();
        let meter = meter.clone();
        if let Some(item) = self.registry.get_mut(id) {
            item.speed_bytes_per_sec = speed;
            item.estimated_seconds_remaining = item.remaining_bytes().and_then(|r| meter.eta(r));
        }
        self.emit(id, EventKind::Progress);
    }

    /// 传输层报告了真实大小
    pub fn on_size_known(&mut self, handle: TransferHandle, size: u64, clock: PassClock) {
        if !self.is_current(&handle) {
            return;
        }
        let id = handle.item_id;
        let Some(item) = self.registry.get(id) else {
            return;
        };
        if item.size_bytes == Some(size) {
            return;
        }

        let threshold = self.settings.storage_threshold_percent;
        if self.ledger.resize(id, size, threshold) {
            if let Some(item) = self.registry.get_mut(id) {
                debug!("任务 {} 的大小确定为 {} 字节", id, size);
                item.size_bytes = Some(size);
                item.progress_bytes = item.progress_bytes.min(size);
            }
            self.outbox.dirty = true;
            return;
        }

        if let Some(item) = self.registry.get_mut(id) {
            item.size_bytes = Some(size);
        }
        self.size_floors.remove(&id);
        self.requeue_for_storage(id, size, clock);
    }

    /// 大小未知时，进度超过预留就扩大预留；超出阈值则重新排队并返回 false
    fn cover_unknown_size(&mut self, id: ItemId, progress: u64, clock: PassClock) -> bool {
        if self.registry.get(id).map_or(true, |item| item.size_bytes.is_some()) {
            return true;
        }
        let Some((_, reserved)) = self.ledger.reservation(id) else {
            return true;
        };
        if progress <= reserved {
            return true;
        }
        let floor = self.size_floors.entry(id).or_default();
        *floor = (*floor).max(progress);
        if self.ledger.resize(id, progress, self.settings.storage_threshold_percent) {
            debug!("任务 {} 大小未知, 预留扩大到 {} 字节", id, progress);
            self.outbox.dirty = true;
            return true;
        }
        self.requeue_for_storage(id, progress, clock);
        false
    }

    /// 所需空间超出阈值：停止传输，释放预留，回到队列等待空间
    fn requeue_for_storage(&mut self, id: ItemId, required: u64, clock: PassClock) {
        let threshold = self.settings.storage_threshold_percent;
        let (device, reserved) = match self.ledger.reservation(id) {
            Some((device, bytes)) => (device.clone(), bytes),
            None => (String::new(), 0),
        };
        let available = self.ledger.available(&device, threshold) + reserved;
        warn!(
            "任务 {} 需要 {} 字节, 超出设备 {} 的可用空间 {} 字节, 重新排队",
            id, required, device, available
        );
        self.stop_transfer(id);
        self.ledger.release(id);
        if let Some(item) = self.registry.get_mut(id) {
            item.progress_bytes = 0;
            item.assigned_device_id = None;
            item.clear_rates();
        }
        self.transition(id, ItemStatus::Queued);
        self.record_denial(
            id,
            AdmissionDenial::InsufficientStorage {
                device,
                required,
                available,
            },
        );
        self.schedule(clock);
    }

    pub fn on_done(&mut self, handle: TransferHandle, clock: PassClock) {
        if !self.is_current(&handle) {
            return;
        }
        let id = handle.item_id;
        let Some(item) = self.registry.get(id) else {
            return;
        };
        let (progress, size) = (item.progress_bytes, item.size_bytes);
        if let Some(size) = size {
            if progress < size {
                self.on_failed(
                    handle,
                    TransportError::SizeMismatch {
                        expected: size,
                        actual: progress,
                    },
                    clock,
                );
                return;
            }
        }

        self.runs.remove(&id);
        self.meters.remove(&id);
        self.backoff.remove(&id);
        self.denials.remove(&id);
        self.size_floors.remove(&id);
        self.ledger.commit(id, progress);
        if let Some(item) = self.registry.get_mut(id) {
            item.size_bytes = Some(progress);
            item.attempts = 0;
            item.assigned_device_id = None;
            item.last_error = None;
            item.completed_at = Some(Utc::now());
            item.clear_rates();
            info!("任务完成: {} ({} 字节)", item.title, progress);
        }
        self.transition(id, ItemStatus::Completed);
        self.schedule(clock);
    }

    /// 传输失败：释放预留、进度清零；可重试时退避后重新排队，否则进入 error
    pub fn on_failed(&mut self, handle: TransferHandle, failure: TransportError, clock: PassClock) {
        if !self.is_current(&handle) {
            return;
        }
        let id = handle.item_id;
        self.runs.remove(&id);
        self.meters.remove(&id);
        self.ledger.release(id);

        let Some(item) = self.registry.get_mut(id) else {
            return;
        };
        item.attempts += 1;
        item.progress_bytes = 0;
        item.assigned_device_id = None;
        item.pause_reason = None;
        item.last_error = Some(failure.to_string());
        item.clear_rates();
        let attempts = item.attempts;
        let title = item.title.clone();

        match self.options.retry.decide(attempts, &failure) {
            RetryDecision::RetryAfter(delay) => {
                warn!("[{}] 第 {} 次传输失败: {}, {:?} 后重试", title, attempts, failure, delay);
                self.backoff.insert(id, clock.now + delay);
                self.transition(id, ItemStatus::Queued);
                self.emit(id, EventKind::RetryScheduled { attempt: attempts, delay });
                self.outbox.commands.push(Command::WakeAfter(delay));
            }
            RetryDecision::GiveUp => {
                error!("[{}] 传输失败, 不再重试: {}", title, failure);
                self.transition(id, ItemStatus::Error);
                let kind = if failure.is_fatal() {
                    EventKind::Failed {
                        error: failure.to_string(),
                    }
                } else {
                    EventKind::RetryExhausted {
                        attempts,
                        error: failure.to_string(),
                    }
                };
                self.emit(id, kind);
            }
        }
        self.schedule(clock);
    }

    // ---- 调度 ----

    pub fn schedule(&mut self, clock: PassClock) {
        let budget = BandwidthBudget::from_devices(
            self.registry.devices(),
            self.settings.global_bandwidth_limit_percent,
        );

        self.evict_offline();
        self.enforce_limits(&budget);

        let mut active = self.active_transfers();
        let mut slots = self.settings.max_concurrent_downloads.saturating_sub(active.len());
        let candidates = self.candidates(clock.now);
        let mut started = Vec::new();

        if !candidates.is_empty() {
            if !self.settings.window_permits(clock.local) {
                for id in candidates {
                    self.record_denial(id, AdmissionDenial::OutsideWindow);
                }
            } else {
                for id in candidates {
                    if slots == 0 {
                        self.record_denial(id, AdmissionDenial::NoSlots);
                        continue;
                    }
                    match self.admit(id, &budget, &active) {
                        Ok(device_id) => {
                            self.activate(id, device_id, clock.now, &mut active);
                            started.push(id);
                            slots -= 1;
                        }
                        Err(denial) => self.record_denial(id, denial),
                    }
                }
            }
        }

        let allocation = self.allocator.redistribute(&budget, &active);
        let floor = self.allocator.min_item_bandwidth();
        for transfer in &active {
            let bandwidth = allocation.get(&transfer.id).copied().unwrap_or(floor);
            let Some(handle) = self.handle(transfer.id) else {
                continue;
            };
            let Some(item) = self.registry.get_mut(transfer.id) else {
                continue;
            };
            if item.allocated_bandwidth != bandwidth && !started.contains(&transfer.id) {
                self.outbox.commands.push(Command::SetBandwidth {
                    handle,
                    bytes_per_sec: bandwidth,
                });
            }
            item.allocated_bandwidth = bandwidth;
        }

        for id in started {
            let (Some(handle), Some(item)) = (self.handle(id), self.registry.get(id)) else {
                continue;
            };
            let request = TransferRequest {
                handle,
                url: item.url.clone(),
                resume_from: item.progress_bytes,
                size_hint: item.size_bytes,
            };
            let bandwidth = item.allocated_bandwidth;
            self.outbox.commands.push(Command::Start { request, bandwidth });
        }
    }

    fn active_transfers(&self) -> Vec<ActiveTransfer> {
        let mut active: Vec<ActiveTransfer> = self
            .registry
            .items()
            .filter(|i| i.status == ItemStatus::Downloading)
            .filter_map(|i| {
                Some(ActiveTransfer {
                    id: i.id,
                    device_id: i.assigned_device_id.clone()?,
                    priority: i.priority,
                    sequence: i.sequence,
                })
            })
            .collect();
        active.sort_by_key(|t| t.sequence);
        active
    }

    fn candidates(&self, now: Instant) -> Vec<ItemId> {
        let mut items: Vec<&DownloadItem> = self
            .registry
            .items()
            .filter(|i| i.is_candidate())
            .filter(|i| self.backoff.get(&i.id).map_or(true, |until| *until <= now))
            .collect();
        let smart = self.settings.smart_queue_enabled;
        items.sort_by(|a, b| compare_candidates(a, b, smart));
        items.into_iter().map(|i| i.id).collect()
    }

    /// 设备离线的下载任务转为暂停，进度和存储预留保留
    fn evict_offline(&mut self) {
        let offline: Vec<(ItemId, DeviceId)> = self
            .registry
            .items()
            .filter(|i| i.status == ItemStatus::Downloading)
            .filter_map(|i| {
                let device_id = i.assigned_device_id.clone()?;
                let online = self.registry.device(&device_id).map_or(false, |d| d.is_online);
                (!online).then_some((i.id, device_id))
            })
            .collect();
        for (id, device) in offline {
            warn!("设备 {} 不可用, 暂停任务 {}", device, id);
            self.stop_transfer(id);
            self.hold(id, PauseReason::DeviceOffline);
            self.emit(id, EventKind::DeviceUnavailable { device });
        }
    }

    /// 设置收紧后抢占：优先级最低、入队最晚的任务先让出
    fn enforce_limits(&mut self, budget: &BandwidthBudget) {
        let mut active = self.active_transfers();
        loop {
            let over_slots = active.len() > self.settings.max_concurrent_downloads;
            if !over_slots && self.allocator.is_feasible(budget, &active) {
                break;
            }
            let over_global = self.allocator.exceeds_global(budget, &active);
            let overloaded = self.allocator.overloaded_devices(budget, &active);

            let victim = active
                .iter()
                .enumerate()
                .filter(|(_, t)| over_slots || over_global || overloaded.contains(&t.device_id))
                .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.sequence.cmp(&a.sequence)))
                .map(|(index, _)| index);
            let Some(index) = victim else {
                break;
            };
            let victim = active.remove(index);
            info!("限制收紧, 抢占任务 {} (优先级 {:?})", victim.id, victim.priority);
            self.stop_transfer(victim.id);
            self.hold(victim.id, PauseReason::Preempted);
        }
    }

    /// 存储 + 带宽准入，返回选中的设备
    fn admit(
        &mut self,
        id: ItemId,
        budget: &BandwidthBudget,
        active: &[ActiveTransfer],
    ) -> Result<DeviceId, AdmissionDenial> {
        // 持有预留的任务只能回到原设备继续
        let held = self.ledger.reservation(id).map(|(device_id, _)| device_id.clone());
        if let Some(device_id) = held {
            return self.try_device(&device_id, id, 0, budget, active).map(|_| device_id);
        }

        let Some(item) = self.registry.get(id) else {
            return Err(AdmissionDenial::Deferred);
        };
        let floor = self.size_floors.get(&id).copied().unwrap_or(0);
        let required = item
            .size_bytes
            .unwrap_or_else(|| self.options.unknown_size_reservation.max(floor));
        if let Some(target) = item.target_device_id.clone() {
            return self.try_device(&target, id, required, budget, active).map(|_| target);
        }

        let threshold = self.settings.storage_threshold_percent;
        let mut online: Vec<(DeviceId, u64)> = self
            .registry
            .devices()
            .into_iter()
            .filter(|d| d.is_online)
            .map(|d| (d.id.clone(), self.ledger.available(&d.id, threshold)))
            .collect();
        if online.is_empty() {
            return Err(AdmissionDenial::NoOnlineDevice);
        }
        online.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut first_denial = None;
        for (device_id, _) in online {
            match self.try_device(&device_id, id, required, budget, active) {
                Ok(()) => return Ok(device_id),
                Err(denial) => {
                    first_denial.get_or_insert(denial);
                }
            }
        }
        Err(first_denial.unwrap_or(AdmissionDenial::NoOnlineDevice))
    }

    fn try_device(
        &mut self,
        device_id: &str,
        id: ItemId,
        required: u64,
        budget: &BandwidthBudget,
        active: &[ActiveTransfer],
    ) -> Result<(), AdmissionDenial> {
        let online = self.registry.device(device_id).map_or(false, |d| d.is_online);
        if !online {
            return Err(AdmissionDenial::DeviceOffline(device_id.to_string()));
        }

        let threshold = self.settings.storage_threshold_percent;
        let holds = self.ledger.reservation(id).is_some();
        if !holds && !self.ledger.reserve(device_id, id, required, threshold) {
            return Err(AdmissionDenial::InsufficientStorage {
                device: device_id.to_string(),
                required,
                available: self.ledger.available(device_id, threshold),
            });
        }
        if !self.allocator.admit(budget, device_id, active) {
            if !holds {
                self.ledger.release(id);
            }
            return Err(AdmissionDenial::InsufficientBandwidth(device_id.to_string()));
        }
        Ok(())
    }

    fn activate(&mut self, id: ItemId, device_id: DeviceId, now: Instant, active: &mut Vec<ActiveTransfer>) {
        self.next_run += 1;
        self.runs.insert(id, self.next_run);
        self.meters.insert(id, SpeedMeter::new(now));
        self.backoff.remove(&id);
        self.denials.remove(&id);

        let Some(item) = self.registry.get_mut(id) else {
            return;
        };
        // 换了设备，之前的部分数据不可用
        if item.assigned_device_id.as_deref() != Some(device_id.as_str()) {
            item.progress_bytes = 0;
        }
        item.assigned_device_id = Some(device_id.clone());
        item.pause_reason = None;
        debug!("准入任务 {} -> 设备 {} (从 {} 字节开始)", item.title, device_id, item.progress_bytes);
        active.push(ActiveTransfer {
            id,
            device_id,
            priority: item.priority,
            sequence: item.sequence,
        });
        self.transition(id, ItemStatus::Downloading);
    }

    // ---- 内部工具 ----

    fn stop_transfer(&mut self, id: ItemId) -> bool {
        self.meters.remove(&id);
        match self.runs.remove(&id) {
            Some(run_id) => {
                self.outbox
                    .commands
                    .push(Command::Stop(TransferHandle { item_id: id, run_id }));
                true
            }
            None => false,
        }
    }

    fn hold(&mut self, id: ItemId, reason: PauseReason) {
        self.denials.remove(&id);
        if let Some(item) = self.registry.get_mut(id) {
            item.pause_reason = Some(reason);
            item.clear_rates();
        }
        self.outbox.dirty = true;
        self.transition(id, ItemStatus::Paused);
    }

    fn discard(&mut self, id: ItemId, forget_committed: bool) -> Option<DownloadItem> {
        self.stop_transfer(id);
        let freed = if forget_committed {
            self.ledger.forget(id)
        } else {
            self.ledger.release(id)
        };
        self.backoff.remove(&id);
        self.denials.remove(&id);
        self.size_floors.remove(&id);
        let mut item = self.registry.remove(id)?;
        debug!("移除任务 {}, 归还 {} 字节存储", item.title, freed);
        item.assigned_device_id = None;
        item.clear_rates();
        self.outbox.events.push(event_for(&item, EventKind::Removed));
        self.outbox.dirty = true;
        Some(item)
    }

    fn transition(&mut self, id: ItemId, status: ItemStatus) {
        self.registry.set_status(id, status);
        self.outbox.dirty = true;
        self.emit(id, EventKind::StatusChanged);
    }

    fn record_denial(&mut self, id: ItemId, denial: AdmissionDenial) {
        if self.denials.get(&id) == Some(&denial) {
            return;
        }
        self.emit(
            id,
            EventKind::AdmissionDenied {
                reason: denial.to_string(),
            },
        );
        self.denials.insert(id, denial);
    }

    fn emit(&mut self, id: ItemId, kind: EventKind) {
        if let Some(item) = self.registry.get(id) {
            self.outbox.events.push(event_for(item, kind));
        }
    }
}
