mod progress;

use std::fmt;
use std::time::Duration;

pub use progress::ProgressSink;

use crate::core::scheduler::QueueStats;

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

pub struct DownloadSummary {
    pub total_items: usize,
    pub total_size: u64,
    pub elapsed_time: Duration,
    pub success_count: usize,
    pub failed_count: usize,
    pub unfinished_count: usize,
}

impl DownloadSummary {
    pub fn from_stats(stats: &QueueStats, elapsed_time: Duration) -> Self {
        Self {
            total_items: stats.total(),
            total_size: stats.downloaded_bytes,
            elapsed_time,
            success_count: stats.completed,
            failed_count: stats.error,
            unfinished_count: stats.queued + stats.downloading + stats.paused,
        }
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "总任务数: {}", self.total_items)?;
        writeln!(f, "已下载: {}", format_size(self.total_size))?;
        writeln!(f, "耗时: {:.2}秒", self.elapsed_time.as_secs_f64())?;
        writeln!(f, "成功: {}", self.success_count)?;
        writeln!(f, "失败: {}", self.failed_count)?;
        if self.unfinished_count > 0 {
            writeln!(f, "未完成: {}", self.unfinished_count)?;
        }
        Ok(())
    }
}

pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(speed: u64) -> String {
    if speed > 1024 * 1024 {
        format!("{:.2} MB/s", speed as f64 / (1024.0 * 1024.0))
    } else if speed > 1024 {
        format!("{:.2} KB/s", speed as f64 / 1024.0)
    } else {
        format!("{} B/s", speed)
    }
}

pub fn format_eta(seconds: Option<u64>) -> String {
    match seconds {
        Some(s) if s > 3600 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        Some(s) if s > 60 => format!("{}m{}s", s / 60, s % 60),
        Some(s) => format!("{}s", s),
        None => "未知".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_format_speed_and_eta() {
        assert_eq!(format_speed(100), "100 B/s");
        assert_eq!(format_speed(2048), "2.00 KB/s");
        assert_eq!(format_speed(3 * 1024 * 1024), "3.00 MB/s");
        assert_eq!(format_eta(None), "未知");
        assert_eq!(format_eta(Some(42)), "42s");
        assert_eq!(format_eta(Some(125)), "2m5s");
        assert_eq!(format_eta(Some(7260)), "2h1m");
    }

    #[test]
    fn test_summary_from_stats() {
        let stats = QueueStats {
            completed: 3,
            error: 1,
            paused: 1,
            downloaded_bytes: 2048,
            ..Default::default()
        };
        let summary = DownloadSummary::from_stats(&stats, Duration::from_secs(2));
        assert_eq!(summary.total_items, 5);
        assert_eq!(summary.unfinished_count, 1);
        let text = summary.to_string();
        assert!(text.contains("成功: 3"));
        assert!(text.contains("失败: 1"));
        assert!(text.contains("未完成: 1"));
        assert!(text.contains("2.00 KB"));
    }
}
