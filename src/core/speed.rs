use std::time::{Duration, Instant};

/// 平滑系数，越大越跟随最新采样
const SMOOTHING: f64 = 0.3;
/// 采样窗口太短时速度会剧烈抖动
const MIN_WINDOW: Duration = Duration::from_millis(200);

/// 速度计：按窗口累积字节数，再做指数平滑
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    smoothed: Option<f64>,
}

impl SpeedMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            window_bytes: 0,
            smoothed: None,
        }
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.window_bytes = self.window_bytes.saturating_add(bytes);
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < MIN_WINDOW {
            return;
        }
        let rate = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.smoothed = Some(match self.smoothed {
            Some(previous) => SMOOTHING * rate + (1.0 - SMOOTHING) * previous,
            None => rate,
        });
        self.window_start = now;
        self.window_bytes = 0;
    }

    /// B/s
    pub fn speed(&self) -> u64 {
        self.smoothed.map(|s| s.round() as u64).unwrap_or(0)
    }

    /// 剩余时间（秒），速度未知时为 None
    pub fn eta(&self, remaining: u64) -> Option<u64> {
        let speed = self.speed();
        if speed == 0 {
            return None;
        }
        Some((remaining + speed - 1) / speed)
    }
}
