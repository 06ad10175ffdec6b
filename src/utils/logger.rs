use chrono::Local;
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use actix::prelude::*;

use crate::core::sink::{DownloadEvent, EventKind, EventSink};

/// 写入一条队列事件
pub struct RecordEvent(pub DownloadEvent);
impl Message for RecordEvent { type Result = (); }

/// 把缓冲区写入磁盘
pub struct FlushLog;
impl Message for FlushLog { type Result = (); }

/// 事件日志 Actor：每个事件一行，超过大小后轮转到 .backup
pub struct EventLogActor {
    writer: BufWriter<File>,
    level: LevelFilter,
    file_path: String,
    max_size: u64,
    current_size: u64,
}

impl EventLogActor {
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        if let Some(parent) = Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            level,
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    fn write_event(&mut self, event: &DownloadEvent) -> Result<(), std::io::Error> {
        let level = event_level(&event.kind);
        if level > self.level {
            return Ok(());
        }
        let entry = format!(
            "{} [{}] {} ({}) {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            event.title,
            event.item_id,
            event.status,
            describe(event)
        );

        self.check_rotation()?;
        self.writer.write_all(entry.as_bytes())?;
        self.current_size += entry.len() as u64;

        // 进度之外的事件立即落盘
        if level <= LevelFilter::Info {
            self.writer.flush()?;
        }
        Ok(())
    }
}

fn event_level(kind: &EventKind) -> LevelFilter {
    match kind {
        EventKind::Progress => LevelFilter::Trace,
        EventKind::AdmissionDenied { .. } => LevelFilter::Debug,
        EventKind::Enqueued | EventKind::StatusChanged | EventKind::Removed => LevelFilter::Info,
        EventKind::RetryScheduled { .. } | EventKind::DeviceUnavailable { .. } => LevelFilter::Warn,
        EventKind::RetryExhausted { .. } | EventKind::Failed { .. } => LevelFilter::Error,
    }
}

fn describe(event: &DownloadEvent) -> String {
    let snapshot = &event.snapshot;
    match &event.kind {
        EventKind::Enqueued => "加入队列".to_string(),
        EventKind::StatusChanged => format!("状态变化, 进度 {} 字节", snapshot.progress_bytes),
        EventKind::Progress => format!(
            "进度 {} 字节, 速度 {} B/s",
            snapshot.progress_bytes, snapshot.speed_bytes_per_sec
        ),
        EventKind::RetryScheduled { attempt, delay } => format!("第 {} 次失败, {:?} 后重试", attempt, delay),
        EventKind::RetryExhausted { attempts, error } => format!("重试 {} 次后放弃: {}", attempts, error),
        EventKind::Failed { error } => format!("不可重试的错误: {}", error),
        EventKind::AdmissionDenied { reason } => format!("暂未准入: {}", reason),
        EventKind::DeviceUnavailable { device } => format!("设备 {} 不可用", device),
        EventKind::Removed => "已移除".to_string(),
    }
}

impl Actor for EventLogActor {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _ = self.writer.flush();
    }
}

impl Handler<RecordEvent> for EventLogActor {
    type Result = ();
    fn handle(&mut self, msg: RecordEvent, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_event(&msg.0) {
            log::error!("事件日志写入失败: {}", e);
        }
    }
}

impl Handler<FlushLog> for EventLogActor {
    type Result = ();
    fn handle(&mut self, _msg: FlushLog, _ctx: &mut Self::Context) {
        if let Err(e) = self.writer.flush() {
            log::error!("事件日志刷新失败: {}", e);
        }
    }
}

// do_send 不等待，满足 EventSink 不阻塞的要求
impl EventSink for Addr<EventLogActor> {
    fn notify(&self, event: DownloadEvent) {
        self.do_send(RecordEvent(event));
    }
}
