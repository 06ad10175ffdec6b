use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use anyhow::Context as _;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal;
use log::{info, LevelFilter};
use tokio::sync::mpsc;

use dlqueue::cli::Args;
use dlqueue::config::Config;
use dlqueue::core::{
    DownloadManagerActor, EnqueueRequest, EventSink, FanoutSink, ItemFilter, ItemId, ItemStatus, LogEventSink,
    QueueHandle,
};
use dlqueue::transport::{FailurePlan, SimulatedTransport};
use dlqueue::ui::{print_error, print_success, DownloadSummary, ProgressSink};
use dlqueue::utils::logger::EventLogActor;
use dlqueue::utils::validator::{title_from_url, validate_url};

const STATS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
enum KeyCommand {
    PauseAll,
    ResumeAll,
    CancelAll,
    Quit,
}

#[actix::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let (args, config) = Args::parse_args().context("参数解析失败")?;
    let urls = args.get_urls().context("获取URL列表失败")?;

    println!("{}", config.get_summary());
    info!("解析到的URLs: {:?}", urls);

    let progress = Arc::new(ProgressSink::new());
    let queue = start_queue(&args, &config, progress.clone())?;

    let ids = enqueue_all(&queue, &args, &urls).await;
    if ids.is_empty() {
        eprintln!("没有可下载的任务");
        queue.shutdown().await?;
        return Ok(());
    }

    println!("\n开始下载... (按 'p' 暂停, 'r' 恢复, 'c' 取消, 'q' 退出)");
    let started = Instant::now();
    run_queue_loop(&queue).await?;
    progress.finish();

    let stats = queue.stats().await?;
    println!("{}", DownloadSummary::from_stats(&stats, started.elapsed()));
    info!("下载结束 - 成功: {}, 失败: {}", stats.completed, stats.error);

    queue.shutdown().await?;
    Ok(())
}

fn start_queue(args: &Args, config: &Config, progress: Arc<ProgressSink>) -> anyhow::Result<QueueHandle> {
    let transport = SimulatedTransport::new(args.sim_size_mb * 1024 * 1024).with_failures(FailurePlan {
        fail_first: args.sim_fail_first,
        failure_rate: args.sim_failure_rate.clamp(0.0, 1.0),
        ..Default::default()
    });

    let mut sink = FanoutSink::new().with(Arc::new(LogEventSink)).with(progress);
    if !config.event_log_file.is_empty() {
        let event_log = EventLogActor::new(&config.event_log_file, LevelFilter::Info, config.event_log_max_size)
            .with_context(|| format!("无法打开事件日志 {}", config.event_log_file))?
            .start();
        sink = sink.with(Arc::new(event_log));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let actor = DownloadManagerActor::from_config(config, Arc::new(transport), sink)?;
    Ok(QueueHandle::start(actor))
}

async fn enqueue_all(queue: &QueueHandle, args: &Args, urls: &[String]) -> Vec<ItemId> {
    let mut ids = Vec::new();
    for url in urls {
        let parsed = match validate_url(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                print_error(&format!("{}", e));
                continue;
            }
        };
        let title = title_from_url(&parsed);
        let mut request = EnqueueRequest::new(title.clone(), url.clone()).priority(args.priority);
        if let Some(device) = &args.device {
            request = request.device(device.clone());
        }
        match queue.enqueue(request).await {
            Ok(id) => {
                print_success(&format!("加入队列: {}", title));
                ids.push(id);
            }
            Err(e) => print_error(&format!("加入队列失败: {} - {}", url, e)),
        }
    }
    ids
}

/// 在单独的线程中读取键盘，避免阻塞 actix 运行时
fn spawn_keyboard_reader(stop: Arc<AtomicBool>) -> Option<mpsc::UnboundedReceiver<KeyCommand>> {
    if terminal::enable_raw_mode().is_err() {
        return None;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if !matches!(event::poll(KEYBOARD_POLL_INTERVAL), Ok(true)) {
                continue;
            }
            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };
            let command = match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyCommand::Quit,
                KeyCode::Char('p') | KeyCode::Char('P') => KeyCommand::PauseAll,
                KeyCode::Char('r') | KeyCode::Char('R') => KeyCommand::ResumeAll,
                KeyCode::Char('c') | KeyCode::Char('C') => KeyCommand::CancelAll,
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => KeyCommand::Quit,
                _ => continue,
            };
            if tx.send(command).is_err() {
                break;
            }
        }
    });
    Some(rx)
}

/// 主循环：处理按键，等待所有任务结束
async fn run_queue_loop(queue: &QueueHandle) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut keys = spawn_keyboard_reader(stop.clone());
    let mut ticker = tokio::time::interval(STATS_POLL_INTERVAL);

    let result = loop {
        tokio::select! {
            command = next_key(&mut keys) => {
                match command {
                    Some(KeyCommand::Quit) => {
                        info!("用户主动退出");
                        break Ok(());
                    }
                    Some(command) => {
                        if let Err(e) = apply_key(queue, command).await {
                            break Err(e);
                        }
                    }
                    None => keys = None,
                }
            }
            _ = ticker.tick() => {
                match queue.stats().await {
                    Ok(stats) if stats.total() > 0 && stats.all_terminal() => break Ok(()),
                    Ok(_) => {}
                    Err(e) => break Err(e.into()),
                }
            }
        }
    };

    stop.store(true, Ordering::Relaxed);
    if keys.is_some() {
        let _ = terminal::disable_raw_mode();
    }
    result
}

async fn next_key(keys: &mut Option<mpsc::UnboundedReceiver<KeyCommand>>) -> Option<KeyCommand> {
    match keys {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn apply_key(queue: &QueueHandle, command: KeyCommand) -> anyhow::Result<()> {
    let items = queue.list(ItemFilter::all()).await?;
    for item in items.iter().filter(|item| !item.status.is_terminal()) {
        // 单个任务的失败（例如准入被拒绝）不影响其他任务
        let outcome = match command {
            KeyCommand::PauseAll => queue.pause(item.id).await.map(|_| ()),
            KeyCommand::ResumeAll if item.status == ItemStatus::Paused => queue.resume(item.id).await.map(|_| ()),
            KeyCommand::CancelAll => queue.cancel(item.id).await,
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            info!("[{}] {:?} 未生效: {}", item.title, command, e);
        }
    }
    Ok(())
}
