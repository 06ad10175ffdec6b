//! 调度器 actor：邮箱就是唯一的写入通道，所有调用、worker 回报、
//! 重试定时器和周期 tick 都在这里串行处理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use log::{debug, error, info};
use tokio::sync::oneshot;

use super::error::DownloadResult;
use super::model::ItemId;
use super::scheduler::{Command, PassClock, SchedulerCore};
use super::sink::EventSink;
use super::store::StateStore;
use super::worker;
use crate::config::Config;
use crate::transport::{TransferHandle, Transport};

const DEFAULT_TICK: Duration = Duration::from_secs(1);
const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerHandle {
    run_id: u64,
    stop: oneshot::Sender<()>,
}

/// 全局下载调度 Actor
pub struct DownloadManagerActor {
    pub(super) core: SchedulerCore,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    store: Option<Box<dyn StateStore>>,
    workers: HashMap<ItemId, WorkerHandle>,
    tick_interval: Duration,
    cancel_timeout: Duration,
}

impl Actor for DownloadManagerActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("下载调度器启动, tick 间隔 {:?}", self.tick_interval);
        ctx.run_interval(self.tick_interval, |act, ctx| {
            act.run_pass(ctx);
            // 进度不会触发持久化，下载中时由 tick 定期保存
            if act.core.has_active() {
                act.persist();
            }
        });
        // 恢复上次未完成的任务
        self.run_pass(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("下载调度器已停止");
    }
}

impl DownloadManagerActor {
    pub fn new(core: SchedulerCore, transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            core,
            transport,
            sink,
            store: None,
            workers: HashMap::new(),
            tick_interval: DEFAULT_TICK,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }

    /// 按配置创建：有状态文件时从快照恢复，否则注册配置中的设备
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> DownloadResult<Self> {
        let store = config.state_store();
        let snapshot = match &store {
            Some(store) => store.load()?,
            None => None,
        };
        let options = config.scheduler_options();
        let mut core = match snapshot {
            Some(snapshot) => SchedulerCore::from_snapshot(snapshot, options)?,
            None => SchedulerCore::new(config.global_settings()?, options)?,
        };
        let known: Vec<String> = core.devices().into_iter().map(|d| d.id).collect();
        for device in config.devices() {
            if !known.contains(&device.id) {
                core.register_device(device, PassClock::current())?;
            }
        }
        // 创建阶段不启动任何传输，留到 actor 启动后的第一轮
        let _ = core.take_outbox();

        let mut actor = Self::new(core, transport, sink)
            .with_timing(config.tick_interval(), config.cancel_timeout());
        actor.store = store;
        Ok(actor)
    }

    pub fn with_store(mut self, store: Box<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_timing(mut self, tick_interval: Duration, cancel_timeout: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.cancel_timeout = cancel_timeout;
        self
    }

    pub(super) fn run_pass(&mut self, ctx: &mut Context<Self>) {
        self.core.schedule(PassClock::current());
        self.flush(ctx);
    }

    /// 执行调度核心产生的指令、分发事件、必要时持久化
    pub(super) fn flush(&mut self, ctx: &mut Context<Self>) {
        let outbox = self.core.take_outbox();
        for command in outbox.commands {
            self.execute(command, ctx);
        }
        for event in outbox.events {
            self.sink.notify(event);
        }
        if outbox.dirty {
            self.persist();
        }
    }

    fn execute(&mut self, command: Command, ctx: &mut Context<Self>) {
        match command {
            Command::Start { request, bandwidth } => {
                let handle = request.handle;
                debug!("启动传输 {} (run {}), 带宽 {} B/s", handle.item_id, handle.run_id, bandwidth);
                let (stop_tx, stop_rx) = oneshot::channel();
                let previous = self.workers.insert(
                    handle.item_id,
                    WorkerHandle {
                        run_id: handle.run_id,
                        stop: stop_tx,
                    },
                );
                if let Some(previous) = previous {
                    let _ = previous.stop.send(());
                }
                let stream = self.transport.start(request, bandwidth);
                actix::spawn(worker::run(handle, stream, stop_rx, ctx.address()));
            }
            Command::Stop(handle) => {
                self.signal_stop(&handle);
                actix::spawn(worker::stop_transfer(self.transport.clone(), handle, self.cancel_timeout));
            }
            Command::SetBandwidth { handle, bytes_per_sec } => {
                self.transport.set_bandwidth(&handle, bytes_per_sec);
            }
            Command::WakeAfter(delay) => {
                ctx.run_later(delay, |act, ctx| act.run_pass(ctx));
            }
        }
    }

    fn signal_stop(&mut self, handle: &TransferHandle) {
        if self.workers.get(&handle.item_id).map(|w| w.run_id) == Some(handle.run_id) {
            if let Some(worker) = self.workers.remove(&handle.item_id) {
                let _ = worker.stop.send(());
            }
        }
    }

    /// worker 已经自行结束
    pub(super) fn forget_worker(&mut self, handle: &TransferHandle) {
        if self.workers.get(&handle.item_id).map(|w| w.run_id) == Some(handle.run_id) {
            self.workers.remove(&handle.item_id);
        }
    }

    pub(super) fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.core.snapshot()) {
                error!("保存队列状态失败: {}", e);
            }
        }
    }
}
