//! dlqueue: 多设备下载队列调度器
//!
//! - `core`: 数据模型、调度核心和调度器 actor
//! - `transport`: 传输层接口和模拟实现
//! - `config` / `cli`: 配置文件和命令行
//! - `ui` / `utils`: 进度显示、事件日志和 URL 校验

pub mod cli;
pub mod config;
pub mod core;
pub mod transport;
pub mod ui;
pub mod utils;
