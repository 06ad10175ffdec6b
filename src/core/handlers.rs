use actix::prelude::*;
use log::info;

use super::error::DownloadResult;
use super::manager::DownloadManagerActor;
use super::messages::*;
use super::model::{DownloadItem, ItemId, ItemStatus};
use super::scheduler::PassClock;
use crate::transport::TransferEvent;

impl Handler<Enqueue> for DownloadManagerActor {
    type Result = DownloadResult<ItemId>;
    fn handle(&mut self, msg: Enqueue, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.enqueue(msg.0, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<SetPriority> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: SetPriority, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.set_priority(msg.id, msg.priority, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<Pause> for DownloadManagerActor {
    type Result = DownloadResult<ItemStatus>;
    fn handle(&mut self, msg: Pause, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.pause(msg.id, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<Resume> for DownloadManagerActor {
    type Result = DownloadResult<ItemStatus>;
    fn handle(&mut self, msg: Resume, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.resume(msg.id, PassClock::current());
        self.flush(ctx);
        result
    }
}

/// 停止信号在回复之前发出，预留也已释放
impl Handler<Cancel> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: Cancel, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.cancel(msg.id, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<Remove> for DownloadManagerActor {
    type Result = DownloadResult<DownloadItem>;
    fn handle(&mut self, msg: Remove, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.remove(msg.id, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<Requeue> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: Requeue, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.requeue(msg.id, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<UpdateSettings> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: UpdateSettings, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.update_settings(msg.0, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<RegisterDevice> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: RegisterDevice, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.register_device(msg.0, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<SetDeviceOnline> for DownloadManagerActor {
    type Result = DownloadResult<()>;
    fn handle(&mut self, msg: SetDeviceOnline, ctx: &mut Self::Context) -> Self::Result {
        let result = self.core.set_device_online(&msg.id, msg.online, PassClock::current());
        self.flush(ctx);
        result
    }
}

impl Handler<ListItems> for DownloadManagerActor {
    type Result = MessageResult<ListItems>;
    fn handle(&mut self, msg: ListItems, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.core.list(&msg.0))
    }
}

impl Handler<GetItem> for DownloadManagerActor {
    type Result = DownloadResult<DownloadItem>;
    fn handle(&mut self, msg: GetItem, _ctx: &mut Self::Context) -> Self::Result {
        self.core.get(msg.id)
    }
}

impl Handler<ListDevices> for DownloadManagerActor {
    type Result = MessageResult<ListDevices>;
    fn handle(&mut self, _msg: ListDevices, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.core.devices())
    }
}

impl Handler<GetSettings> for DownloadManagerActor {
    type Result = MessageResult<GetSettings>;
    fn handle(&mut self, _msg: GetSettings, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.core.settings().clone())
    }
}

impl Handler<GetStats> for DownloadManagerActor {
    type Result = MessageResult<GetStats>;
    fn handle(&mut self, _msg: GetStats, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.core.stats())
    }
}

impl Handler<Subscribe> for DownloadManagerActor {
    type Result = MessageResult<Subscribe>;
    fn handle(&mut self, _msg: Subscribe, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.core.subscribe())
    }
}

impl Handler<Shutdown> for DownloadManagerActor {
    type Result = ();
    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        info!("收到关闭请求, 暂停所有传输");
        self.core.shutdown();
        self.flush(ctx);
        self.persist();
        ctx.stop();
    }
}

impl Handler<TransferReport> for DownloadManagerActor {
    type Result = ();
    fn handle(&mut self, msg: TransferReport, ctx: &mut Self::Context) {
        let handle = msg.handle;
        let clock = PassClock::current();
        match msg.event {
            TransferEvent::SizeKnown(size) => self.core.on_size_known(handle, size, clock),
            TransferEvent::Progress(delta) => self.core.on_progress(handle, delta, clock),
            TransferEvent::Done => {
                self.forget_worker(&handle);
                self.core.on_done(handle, clock);
            }
            TransferEvent::Failed(error) => {
                self.forget_worker(&handle);
                self.core.on_failed(handle, error, clock);
            }
        }
        self.flush(ctx);
    }
}
