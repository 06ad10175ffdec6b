use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};

use dlqueue::core::{
    ChannelEventSink, Device, DownloadError, DownloadEvent, DownloadManagerActor, EnqueueRequest, EventKind,
    GlobalSettings, ItemId, ItemStatus, JsonStateStore, PassClock, PauseReason, Priority, QueueHandle,
    RegistryChange, RetryStrategy, SchedulerCore, SchedulerOptions, StateStore, TransportError,
};
use dlqueue::transport::{TransferEvent, TransferHandle, TransferRequest, TransferStream, Transport};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// 由测试手动推送事件的传输层
#[derive(Default)]
struct ScriptedTransport {
    feeds: Mutex<HashMap<ItemId, mpsc::UnboundedSender<TransferEvent>>>,
    starts: Mutex<Vec<TransferRequest>>,
    stops: Mutex<Vec<TransferHandle>>,
    /// stop 永远不返回，模拟卡住的传输层
    hang_on_stop: bool,
}

impl ScriptedTransport {
    fn push(&self, id: ItemId, event: TransferEvent) {
        let feeds = self.feeds.lock().unwrap();
        let feed = feeds.get(&id).expect("任务没有启动过");
        feed.unbounded_send(event).expect("worker 已退出");
    }

    fn starts_of(&self, id: ItemId) -> Vec<TransferRequest> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.handle.item_id == id)
            .cloned()
            .collect()
    }

    fn stopped(&self, id: ItemId) -> bool {
        self.stops.lock().unwrap().iter().any(|h| h.item_id == id)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn start(&self, request: TransferRequest, _bandwidth: u64) -> TransferStream {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().insert(request.handle.item_id, tx);
        self.starts.lock().unwrap().push(request);
        rx.boxed()
    }

    fn set_bandwidth(&self, _handle: &TransferHandle, _bytes_per_sec: u64) {}

    async fn stop(&self, handle: &TransferHandle) {
        self.stops.lock().unwrap().push(*handle);
        if self.hang_on_stop {
            std::future::pending::<()>().await;
        }
    }
}

struct Harness {
    queue: QueueHandle,
    transport: Arc<ScriptedTransport>,
    events: UnboundedReceiver<DownloadEvent>,
}

fn settings(max_concurrent: usize) -> GlobalSettings {
    GlobalSettings {
        max_concurrent_downloads: max_concurrent,
        ..Default::default()
    }
}

fn options() -> SchedulerOptions {
    SchedulerOptions {
        retry: RetryStrategy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
        ..Default::default()
    }
}

fn start_with(core: SchedulerCore, store: Option<JsonStateStore>) -> Harness {
    launch(core, store, ScriptedTransport::default())
}

fn launch(core: SchedulerCore, store: Option<JsonStateStore>, transport: ScriptedTransport) -> Harness {
    let transport = Arc::new(transport);
    let (sink, events) = ChannelEventSink::new();
    let mut actor = DownloadManagerActor::new(core, transport.clone(), Arc::new(sink))
        .with_timing(Duration::from_millis(20), Duration::from_millis(100));
    if let Some(store) = store {
        actor = actor.with_store(Box::new(store));
    }
    Harness {
        queue: QueueHandle::start(actor),
        transport,
        events,
    }
}

fn start(max_concurrent: usize, devices: Vec<Device>) -> Harness {
    let mut core = SchedulerCore::new(settings(max_concurrent), options()).unwrap();
    for device in devices {
        core.register_device(device, PassClock::current()).unwrap();
    }
    start_with(core, None)
}

async fn wait_status(queue: &QueueHandle, id: ItemId, status: ItemStatus) -> dlqueue::core::DownloadItem {
    for _ in 0..300 {
        let item = queue.get(id).await.unwrap();
        if item.status == status {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("任务 {} 没有进入 {} 状态", id, status);
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待超时");
}

fn drain(events: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut all = Vec::new();
    while let Ok(event) = events.try_recv() {
        all.push(event);
    }
    all
}

#[actix_rt::test]
async fn test_cancel_frees_slot_for_higher_priority() {
    let h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);

    let low = assert_ok!(
        h.queue
            .enqueue(EnqueueRequest::new("low", "https://example.com/low.mp4").size(MB).priority(Priority::Low))
            .await
    );
    let high = assert_ok!(
        h.queue
            .enqueue(EnqueueRequest::new("high", "https://example.com/high.mp4").size(MB).priority(Priority::High))
            .await
    );
    assert_eq!(h.queue.get(low).await.unwrap().status, ItemStatus::Downloading);
    assert_eq!(h.queue.get(high).await.unwrap().status, ItemStatus::Queued);

    assert_ok!(h.queue.cancel(low).await);
    assert!(matches!(h.queue.get(low).await, Err(DownloadError::ItemNotFound(_))));
    assert_eq!(h.queue.get(high).await.unwrap().status, ItemStatus::Downloading);
    assert_eq!(h.transport.starts_of(high).len(), 1);

    let transport = h.transport.clone();
    wait_until(move || transport.stopped(low)).await;
}

#[actix_rt::test]
async fn test_transfer_completes_and_commits_storage() {
    let mut h = start(2, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("song", "https://example.com/song.mp3").size(4000))
        .await
        .unwrap();

    h.transport.push(id, TransferEvent::Progress(1500));
    h.transport.push(id, TransferEvent::Progress(2500));
    h.transport.push(id, TransferEvent::Done);

    let item = wait_status(&h.queue, id, ItemStatus::Completed).await;
    assert_eq!(item.progress_bytes, 4000);
    assert!(item.completed_at.is_some());

    let devices = h.queue.devices().await.unwrap();
    assert_eq!(devices[0].used_storage_bytes, 4000);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| e.kind == EventKind::Enqueued));
    assert!(events.iter().any(|e| e.is_progress()));
    assert_eq!(events.last().unwrap().status, ItemStatus::Completed);

    // 删除已完成的任务归还存储
    assert_ok!(h.queue.remove(id).await);
    assert_eq!(h.queue.devices().await.unwrap()[0].used_storage_bytes, 0);
}

#[actix_rt::test]
async fn test_retry_then_exhausted() {
    let mut h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("flaky", "https://example.com/flaky.bin").size(MB))
        .await
        .unwrap();

    h.transport.push(id, TransferEvent::Failed(TransportError::Timeout));
    let transport = h.transport.clone();
    wait_until(move || transport.starts_of(id).len() == 2).await;

    h.transport.push(id, TransferEvent::Failed(TransportError::Timeout));
    let item = wait_status(&h.queue, id, ItemStatus::Error).await;
    assert_eq!(item.attempts, 2);
    assert!(item.last_error.is_some());

    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::RetryScheduled { attempt: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::RetryExhausted { attempts: 2, .. })));

    // 重新排队后从头开始
    assert_ok!(h.queue.requeue(id).await);
    let item = h.queue.get(id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Downloading);
    assert_eq!(item.attempts, 0);
    assert_eq!(h.transport.starts_of(id).len(), 3);
}

#[actix_rt::test]
async fn test_fatal_error_skips_retry() {
    let mut h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("gone", "https://example.com/gone.bin").size(MB))
        .await
        .unwrap();

    h.transport.push(id, TransferEvent::Failed(TransportError::Client(404)));
    let item = wait_status(&h.queue, id, ItemStatus::Error).await;
    assert_eq!(item.attempts, 1);
    assert_eq!(h.transport.starts_of(id).len(), 1);
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(e.kind, EventKind::Failed { .. })));
}

#[actix_rt::test]
async fn test_device_offline_pauses_and_resumes_from_progress() {
    let mut h = start(2, vec![Device::new("phone", 10 * GB, 10 * MB)]);
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("clip", "https://example.com/clip.mp4").size(MB))
        .await
        .unwrap();

    h.transport.push(id, TransferEvent::Progress(300));
    for _ in 0..300 {
        if h.queue.get(id).await.unwrap().progress_bytes == 300 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_ok!(h.queue.set_device_online("phone", false).await);
    let item = h.queue.get(id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Paused);
    assert_eq!(item.pause_reason, Some(PauseReason::DeviceOffline));
    assert_eq!(item.progress_bytes, 300);
    assert!(drain(&mut h.events)
        .iter()
        .any(|e| matches!(&e.kind, EventKind::DeviceUnavailable { device } if device == "phone")));

    // 存储预留在暂停期间保留
    assert_eq!(h.queue.devices().await.unwrap()[0].used_storage_bytes, MB);

    assert_ok!(h.queue.set_device_online("phone", true).await);
    assert_eq!(h.queue.get(id).await.unwrap().status, ItemStatus::Downloading);
    let starts = h.transport.starts_of(id);
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[1].resume_from, 300);
}

#[actix_rt::test]
async fn test_pause_resume_transitions() {
    let h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("doc", "https://example.com/doc.pdf").size(MB))
        .await
        .unwrap();

    assert_eq!(assert_ok!(h.queue.pause(id).await), ItemStatus::Paused);
    assert_eq!(assert_ok!(h.queue.pause(id).await), ItemStatus::Paused);
    assert_eq!(h.queue.get(id).await.unwrap().pause_reason, Some(PauseReason::User));

    // 用户暂停的任务不会被自动恢复
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.queue.get(id).await.unwrap().status, ItemStatus::Paused);

    assert_eq!(assert_ok!(h.queue.resume(id).await), ItemStatus::Downloading);
    h.transport.push(id, TransferEvent::Progress(MB));
    h.transport.push(id, TransferEvent::Done);
    wait_status(&h.queue, id, ItemStatus::Completed).await;

    let err = assert_err!(h.queue.pause(id).await);
    assert!(matches!(err, DownloadError::InvalidTransition { .. }));
    assert_err!(h.queue.resume(id).await);
    assert_err!(h.queue.cancel(id).await);
}

#[actix_rt::test]
async fn test_resume_denied_when_slots_full() {
    let h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let first = h
        .queue
        .enqueue(EnqueueRequest::new("a", "https://example.com/a.mp4").size(MB))
        .await
        .unwrap();
    assert_ok!(h.queue.pause(first).await);
    let second = h
        .queue
        .enqueue(EnqueueRequest::new("b", "https://example.com/b.mp4").size(MB))
        .await
        .unwrap();
    assert_eq!(h.queue.get(second).await.unwrap().status, ItemStatus::Downloading);

    let err = assert_err!(h.queue.resume(first).await);
    assert!(err.is_transient());
    let item = h.queue.get(first).await.unwrap();
    assert_eq!(item.status, ItemStatus::Paused);
    assert_eq!(item.pause_reason, Some(PauseReason::ResumeRequested));

    // 槽位空出后自动恢复
    h.transport.push(second, TransferEvent::Progress(MB));
    h.transport.push(second, TransferEvent::Done);
    wait_status(&h.queue, first, ItemStatus::Downloading).await;
}

#[actix_rt::test]
async fn test_settings_tightening_preempts_lowest_priority() {
    let h = start(3, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let mut ids = Vec::new();
    for (name, priority) in [("a", Priority::High), ("b", Priority::Low), ("c", Priority::Normal)] {
        let request = EnqueueRequest::new(name, format!("https://example.com/{}.mp4", name))
            .size(MB)
            .priority(priority);
        ids.push(h.queue.enqueue(request).await.unwrap());
    }
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.downloading, 3);

    assert_ok!(h.queue.update_settings(settings(2)).await);
    let low = h.queue.get(ids[1]).await.unwrap();
    assert_eq!(low.status, ItemStatus::Paused);
    assert_eq!(low.pause_reason, Some(PauseReason::Preempted));
    assert_eq!(h.queue.stats().await.unwrap().downloading, 2);

    assert_err!(h.queue.update_settings(settings(0)).await);
}

#[actix_rt::test]
async fn test_subscribe_receives_registry_changes() {
    let h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    let mut changes = h.queue.subscribe().await.unwrap();

    let id = h
        .queue
        .enqueue(EnqueueRequest::new("img", "https://example.com/a.png"))
        .await
        .unwrap();
    assert_eq!(changes.recv().await.unwrap(), RegistryChange::ItemCreated(id));
    assert_eq!(
        changes.recv().await.unwrap(),
        RegistryChange::StatusChanged {
            id,
            status: ItemStatus::Downloading
        }
    );

    assert_ok!(h.queue.set_priority(id, Priority::High).await);
    assert_eq!(
        changes.recv().await.unwrap(),
        RegistryChange::PriorityChanged {
            id,
            priority: Priority::High
        }
    );
}

#[actix_rt::test]
async fn test_invalid_requests_rejected() {
    let h = start(1, vec![Device::new("local", 10 * GB, 10 * MB)]);
    assert!(matches!(
        h.queue.enqueue(EnqueueRequest::new("x", "not a url")).await,
        Err(DownloadError::InvalidUrl(_))
    ));
    assert!(matches!(
        h.queue
            .enqueue(EnqueueRequest::new("x", "https://example.com/x").device("tablet"))
            .await,
        Err(DownloadError::DeviceNotFound(_))
    ));
    assert!(matches!(
        h.queue.register_device(Device::new("local", GB, MB)).await,
        Err(DownloadError::DeviceExists(_))
    ));
    assert!(h.queue.list(Default::default()).await.unwrap().is_empty());
}

#[actix_rt::test]
async fn test_shutdown_persists_and_restart_resumes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("queue.json");

    let mut core = SchedulerCore::new(settings(2), options()).unwrap();
    core.register_device(Device::new("local", 10 * GB, 10 * MB), PassClock::current())
        .unwrap();
    let h = start_with(core, Some(JsonStateStore::new(&path)));
    let id = h
        .queue
        .enqueue(EnqueueRequest::new("movie", "https://example.com/movie.mkv").size(MB))
        .await
        .unwrap();
    h.transport.push(id, TransferEvent::Progress(512));
    for _ in 0..300 {
        if h.queue.get(id).await.unwrap().progress_bytes == 512 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_ok!(h.queue.shutdown().await);

    let snapshot = JsonStateStore::new(&path).load().unwrap().expect("没有保存快照");
    let saved = snapshot.items.iter().find(|i| i.id == id).unwrap();
    assert_eq!(saved.status, ItemStatus::Paused);
    assert_eq!(saved.pause_reason, Some(PauseReason::Restart));

    let core = SchedulerCore::from_snapshot(snapshot, options()).unwrap();
    let h = start_with(core, Some(JsonStateStore::new(&path)));
    let item = wait_status(&h.queue, id, ItemStatus::Downloading).await;
    assert_eq!(item.progress_bytes, 512);
    assert_eq!(h.transport.starts_of(id)[0].resume_from, 512);
}

#[actix_rt::test]
async fn test_cancel_does_not_wait_for_stuck_transport() {
    let mut core = SchedulerCore::new(settings(1), options()).unwrap();
    core.register_device(Device::new("local", 10 * GB, 10 * MB), PassClock::current())
        .unwrap();
    let transport = ScriptedTransport {
        hang_on_stop: true,
        ..Default::default()
    };
    let h = launch(core, None, transport);

    let first = assert_ok!(
        h.queue
            .enqueue(EnqueueRequest::new("first", "https://example.com/first.iso").size(2 * MB))
            .await
    );
    let second = assert_ok!(
        h.queue
            .enqueue(EnqueueRequest::new("second", "https://example.com/second.iso").size(MB))
            .await
    );
    assert_eq!(h.queue.get(second).await.unwrap().status, ItemStatus::Queued);

    // 传输层的 stop 卡住时取消仍然立即返回，预留释放，下一个任务开始
    let cancelled = tokio::time::timeout(Duration::from_millis(100), h.queue.cancel(first)).await;
    assert_ok!(assert_ok!(cancelled));
    let item = wait_status(&h.queue, second, ItemStatus::Downloading).await;
    assert_eq!(item.progress_bytes, 0);
    assert_eq!(h.queue.devices().await.unwrap()[0].used_storage_bytes, MB);
    assert_eq!(h.transport.starts_of(second).len(), 1);

    let transport = h.transport.clone();
    wait_until(move || transport.stopped(first)).await;

    // 超过取消超时后调度器继续正常工作
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.transport.push(second, TransferEvent::Progress(MB));
    h.transport.push(second, TransferEvent::Done);
    wait_status(&h.queue, second, ItemStatus::Completed).await;
    assert_eq!(h.queue.devices().await.unwrap()[0].used_storage_bytes, MB);
}
