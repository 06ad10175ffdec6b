//! Core: 下载队列的数据模型、调度核心、调度器 actor 和错误处理

pub mod bandwidth;
pub mod error;
pub mod handle;
mod handlers;
pub mod ledger;
pub mod manager;
pub mod messages;
pub mod model;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod speed;
pub mod store;
mod worker;

pub use error::{AdmissionDenial, DownloadError, DownloadResult, TransportError};
pub use handle::QueueHandle;
pub use manager::DownloadManagerActor;
pub use model::{
    Device, DeviceId, DeviceType, DownloadItem, EnqueueRequest, GlobalSettings, ItemFilter, ItemId, ItemStatus,
    MediaType, PauseReason, Priority, ProgressSnapshot, ScheduledWindow,
};
pub use registry::RegistryChange;
pub use retry::{RetryDecision, RetryStrategy};
pub use scheduler::{PassClock, QueueStats, SchedulerCore, SchedulerOptions};
pub use sink::{ChannelEventSink, DownloadEvent, EventKind, EventSink, FanoutSink, LogEventSink, NullSink};
pub use store::{JsonStateStore, QueueSnapshot, StateStore};
