//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 加入队列：`dlqueue <url>...`
//! - 批量加入：`dlqueue -f urls.txt`
//! - 编辑配置：`dlqueue -e`
//! - 指定配置：`dlqueue -c dlqueue.conf <url>`
//! - 调度参数：`dlqueue -m 2 -b 50 <url>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/dlqueue/dlqueue.conf`
//! - macOS: `~/Library/Application Support/dlqueue/dlqueue.conf`
//! - Linux: `~/.config/dlqueue/dlqueue.conf`

use std::env;
use std::fs;
use std::path::Path;

use clap::Parser;

use crate::config::Config;
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::model::Priority;
use crate::utils::validator::is_valid_url;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/dlqueue/dlqueue.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/dlqueue/dlqueue.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/dlqueue/dlqueue.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 $EDITOR，其次 xdg-open，最后 nano
        if let Ok(editor) = env::var("EDITOR") {
            if std::process::Command::new(editor).arg(config_path).status().is_ok() {
                return;
            }
        }
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    match value.to_ascii_lowercase().as_str() {
        "high" | "h" => Ok(Priority::High),
        "normal" | "n" => Ok(Priority::Normal),
        "low" | "l" => Ok(Priority::Low),
        other => Err(format!("未知的优先级: {} (可选 high, normal, low)", other)),
    }
}

/// dlqueue 命令行参数
///
/// 示例用法：
///   dlqueue https://example.com/a.mp4 https://example.com/b.mp3
///   dlqueue -e  # 编辑配置文件
///   dlqueue -p high -d phone https://example.com/a.mp4
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dlqueue",
    version = env!("CARGO_PKG_VERSION"),
    about = "多设备下载队列调度器",
    long_about = "按优先级、并发数、带宽和存储空间调度下载队列，支持暂停、恢复、失败重试和计划下载窗口。\n\n示例：\n  dlqueue https://example.com/a.mp4\n  dlqueue -f urls.txt -m 2\n  dlqueue -e\n"
)]
pub struct Args {
    /// 要加入队列的URL列表（可同时指定多个）
    #[arg(required = false, help = "要加入队列的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL，# 开头为注释。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    #[arg(short = 'm', long, help = "最大并发下载数，覆盖配置文件中的设置。")]
    pub max_concurrent: Option<usize>,

    #[arg(short = 'b', long, value_parser = clap::value_parser!(u8).range(1..=100), help = "可使用的设备总带宽百分比 (1-100)。")]
    pub bandwidth_percent: Option<u8>,

    #[arg(short = 's', long, value_parser = clap::value_parser!(u8).range(1..=100), help = "存储准入阈值百分比 (1-100)。")]
    pub storage_threshold: Option<u8>,

    #[arg(long, help = "关闭智能队列（同优先级内短任务优先）。")]
    pub no_smart_queue: bool,

    #[arg(short = 'r', long, help = "可重试错误的最大失败次数。")]
    pub retries: Option<u32>,

    #[arg(long, help = "队列状态文件，用于跨进程恢复。")]
    pub state_file: Option<String>,

    /// 新任务的优先级
    #[arg(short = 'p', long, default_value = "normal", value_parser = parse_priority, help = "新任务的优先级：high, normal, low。")]
    pub priority: Priority,

    /// 指定目标设备
    #[arg(short = 'd', long, help = "指定目标设备 id，默认自动选择。")]
    pub device: Option<String>,

    /// 模拟传输：大小未知时的文件大小（MB）
    #[arg(long, default_value_t = 20, help = "模拟传输的文件大小（MB）。")]
    pub sim_size_mb: u64,

    /// 模拟传输：每一步的随机失败概率
    #[arg(long, default_value_t = 0.0, help = "模拟传输每一步的随机失败概率 (0-1)。")]
    pub sim_failure_rate: f64,

    /// 模拟传输：每个任务前 N 次启动失败
    #[arg(long, default_value_t = 0, help = "模拟传输中每个任务前 N 次启动都失败。")]
    pub sim_fail_first: u32,
}

impl Args {
    /// 解析命令行参数并加载配置
    pub fn parse_args() -> DownloadResult<(Self, Config)> {
        let args = Args::parse();

        if args.edit_config {
            // 确保文件存在再打开
            Config::load(&args.config)?;
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        let config = args.load_config()?;
        Ok((args, config))
    }

    /// 加载或创建配置文件，合并命令行参数后校验
    pub fn load_config(&self) -> DownloadResult<Config> {
        let mut config = Config::load(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok(config)
    }

    /// 命令行和文件中的URL
    pub fn get_urls(&self) -> DownloadResult<Vec<String>> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(DownloadError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("URL文件不存在: {}", file_path),
                )));
            }
            let content = fs::read_to_string(file_path)?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    if !is_valid_url(line) {
                        return Err(DownloadError::InvalidUrl(line.to_string()));
                    }
                    urls.push(line.to_string());
                }
            }
        }

        if urls.is_empty() {
            return Err(DownloadError::InvalidUrl(
                "未提供任何URL。请通过命令行参数或文件提供至少一个URL。".to_string(),
            ));
        }

        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["dlqueue", "-p", "high", "-m", "2", "https://example.com/a.mp4"]).unwrap();
        assert_eq!(args.priority, Priority::High);
        assert_eq!(args.max_concurrent, Some(2));
        assert_eq!(args.urls.len(), 1);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(Args::try_parse_from(["dlqueue", "-p", "urgent", "https://example.com/a"]).is_err());
        assert!(Args::try_parse_from(["dlqueue", "-b", "0", "https://example.com/a"]).is_err());
        assert!(Args::try_parse_from(["dlqueue", "-b", "150", "https://example.com/a"]).is_err());
    }

    #[test]
    fn test_config_merge() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("dlqueue.conf");
        let config_path = config_path.to_str().unwrap();

        let args = Args::try_parse_from([
            "dlqueue",
            "-c",
            config_path,
            "-m",
            "5",
            "-b",
            "40",
            "--no-smart-queue",
            "https://example.com/a.mp4",
        ])
        .unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.global_bandwidth_limit_percent, 40);
        assert!(!config.smart_queue_enabled);
        // 配置文件已创建，且不包含命令行覆盖的值
        let saved = Config::load(config_path).unwrap();
        assert_eq!(saved.max_concurrent_downloads, 3);
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        fs::write(
            &url_file,
            "# 这是一个注释\nhttps://example.com/file1.zip\n\nhttps://example.com/file2.zip\n",
        )
        .unwrap();

        let args = Args::try_parse_from(["dlqueue", "-f", url_file.to_str().unwrap()]).unwrap();
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec!["https://example.com/file1.zip", "https://example.com/file2.zip"]);
    }

    #[test]
    fn test_url_file_rejects_invalid_line() {
        let dir = tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        fs::write(&url_file, "https://example.com/ok.zip\nnot a url\n").unwrap();

        let args = Args::try_parse_from(["dlqueue", "-f", url_file.to_str().unwrap()]).unwrap();
        assert!(matches!(args.get_urls(), Err(DownloadError::InvalidUrl(_))));
    }

    #[test]
    fn test_no_urls() {
        let args = Args::try_parse_from(["dlqueue"]).unwrap();
        assert!(args.get_urls().is_err());
    }
}
