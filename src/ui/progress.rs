use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::{format_eta, format_speed};
use crate::core::model::{ItemId, ItemStatus};
use crate::core::sink::{DownloadEvent, EventKind, EventSink};

const BAR_TEMPLATE: &str = "{prefix:20} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// 终端进度条：每个任务一条
pub struct ProgressSink {
    multi: MultiProgress,
    bars: Mutex<HashMap<ItemId, ProgressBar>>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// 不输出到终端，用于测试
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, bars: &mut HashMap<ItemId, ProgressBar>, event: &DownloadEvent) -> ProgressBar {
        bars.entry(event.item_id)
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(event.snapshot.size_bytes.unwrap_or(0)));
                pb.set_style(bar_style());
                pb.set_prefix(truncate(&event.title, 20));
                pb
            })
            .clone()
    }

    /// 当前显示中的进度条数
    pub fn len(&self) -> usize {
        self.bars.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 结束所有进度条
    pub fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values() {
                if !pb.is_finished() {
                    pb.abandon();
                }
            }
        }
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ProgressSink {
    fn notify(&self, event: DownloadEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        if event.kind == EventKind::Removed {
            if let Some(pb) = bars.remove(&event.item_id) {
                pb.finish_and_clear();
                self.multi.remove(&pb);
            }
            return;
        }

        let pb = self.bar_for(&mut bars, &event);
        let snapshot = &event.snapshot;
        if let Some(size) = snapshot.size_bytes {
            pb.set_length(size);
        }
        pb.set_position(snapshot.progress_bytes);

        let message = match (&event.status, &event.kind) {
            (_, EventKind::RetryScheduled { attempt, delay }) => {
                format!("第 {} 次失败, {:.1}s 后重试", attempt, delay.as_secs_f64())
            }
            (_, EventKind::AdmissionDenied { reason }) => format!("等待: {}", reason),
            (ItemStatus::Downloading, _) => format!(
                "{} | ETA:{}",
                format_speed(snapshot.speed_bytes_per_sec),
                format_eta(snapshot.estimated_seconds_remaining)
            ),
            (ItemStatus::Completed, _) => {
                pb.finish_with_message("完成");
                return;
            }
            (ItemStatus::Error, EventKind::RetryExhausted { error, .. } | EventKind::Failed { error }) => {
                pb.abandon_with_message(format!("失败: {}", error));
                return;
            }
            (status, _) => status.to_string(),
        };
        pb.set_message(message);
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn truncate(title: &str, max: usize) -> String {
    if title.chars().count() <= max {
        title.to_string()
    } else {
        let head: String = title.chars().take(max - 1).collect();
        format!("{}…", head)
    }
}
