use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use log::debug;

use super::{TransferEvent, TransferHandle, TransferRequest, TransferStream, Transport};
use crate::core::error::TransportError;
use crate::core::model::ItemId;

/// 令牌桶限速器
#[derive(Debug)]
pub struct SpeedLimiter {
    pub max_speed: u64, // B/s
    pub window_size: Duration,
    pub tokens: u64,
    pub last_refill: Instant,
}

impl SpeedLimiter {
    pub fn new(max_speed: u64) -> Self {
        Self {
            max_speed,
            window_size: Duration::from_secs(1),
            tokens: max_speed,
            last_refill: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, max_speed: u64) {
        self.max_speed = max_speed;
        self.tokens = self.tokens.min(max_speed);
    }

    pub fn consume(&mut self, bytes: u64) -> bool {
        self.refill_tokens();
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    fn refill_tokens(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= self.window_size {
            self.tokens = self.max_speed;
            self.last_refill = now;
        }
    }

    /// 令牌不足时返回需要等待的时间
    pub fn wait_if_needed(&mut self, bytes: u64) -> Duration {
        if self.consume(bytes) {
            return Duration::ZERO;
        }
        let elapsed = Instant::now().duration_since(self.last_refill);
        self.window_size.saturating_sub(elapsed).max(Duration::from_millis(1))
    }
}

/// 故障注入
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePlan {
    /// 每个任务前 N 次启动都失败
    pub fail_first: u32,
    /// 每一步随机失败的概率
    pub failure_rate: f64,
    pub error: TransportError,
}

impl Default for FailurePlan {
    fn default() -> Self {
        Self {
            fail_first: 0,
            failure_rate: 0.0,
            error: TransportError::Network("simulated connection reset".to_string()),
        }
    }
}

struct Control {
    bandwidth: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

/// 模拟传输层：按分配到的带宽推进进度，不做真实 IO
pub struct SimulatedTransport {
    step: Duration,
    default_size: u64,
    plan: FailurePlan,
    controls: Arc<Mutex<HashMap<TransferHandle, Control>>>,
    starts: Arc<Mutex<HashMap<ItemId, u32>>>,
}

impl SimulatedTransport {
    pub fn new(default_size: u64) -> Self {
        Self {
            step: Duration::from_millis(100),
            default_size,
            plan: FailurePlan::default(),
            controls: Arc::new(Mutex::new(HashMap::new())),
            starts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_failures(mut self, plan: FailurePlan) -> Self {
        self.plan = plan;
        self
    }

    /// 某个任务被启动过几次
    pub fn start_count(&self, item_id: ItemId) -> u32 {
        self.starts
            .lock()
            .map(|s| s.get(&item_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn register(&self, handle: TransferHandle, bandwidth: u64) -> (Arc<AtomicU64>, Arc<AtomicBool>, u32) {
        let rate = Arc::new(AtomicU64::new(bandwidth));
        let stopped = Arc::new(AtomicBool::new(false));
        if let Ok(mut controls) = self.controls.lock() {
            controls.insert(
                handle,
                Control {
                    bandwidth: rate.clone(),
                    stopped: stopped.clone(),
                },
            );
        }
        let attempt = match self.starts.lock() {
            Ok(mut starts) => {
                let count = starts.entry(handle.item_id).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 1,
        };
        (rate, stopped, attempt)
    }
}

struct SimState {
    handle: TransferHandle,
    remaining: u64,
    announce_size: Option<u64>,
    fail_now: bool,
    finished: bool,
    failure_rate: f64,
    error: TransportError,
    step: Duration,
    rate: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    limiter: SpeedLimiter,
    controls: Arc<Mutex<HashMap<TransferHandle, Control>>>,
}

impl SimState {
    fn unregister(&self) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.remove(&self.handle);
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn start(&self, request: TransferRequest, bandwidth: u64) -> TransferStream {
        let (rate, stopped, attempt) = self.register(request.handle, bandwidth);
        let total = request.size_hint.unwrap_or(self.default_size);
        debug!(
            "[sim] 启动传输 {} (第 {} 次), 从 {} 字节续传, 总大小 {}",
            request.handle.item_id, attempt, request.resume_from, total
        );

        let state = SimState {
            handle: request.handle,
            remaining: total.saturating_sub(request.resume_from),
            announce_size: request.size_hint.is_none().then_some(total),
            fail_now: attempt <= self.plan.fail_first,
            finished: false,
            failure_rate: self.plan.failure_rate,
            error: self.plan.error.clone(),
            step: self.step,
            limiter: SpeedLimiter::new(bandwidth.max(1)),
            rate,
            stopped,
            controls: self.controls.clone(),
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            if state.finished || state.stopped.load(Ordering::SeqCst) {
                state.unregister();
                return None;
            }
            if let Some(size) = state.announce_size.take() {
                return Some((TransferEvent::SizeKnown(size), state));
            }
            if state.fail_now || (state.failure_rate > 0.0 && rand::random::<f64>() < state.failure_rate) {
                state.finished = true;
                state.unregister();
                let error = state.error.clone();
                return Some((TransferEvent::Failed(error), state));
            }
            if state.remaining == 0 {
                state.finished = true;
                state.unregister();
                return Some((TransferEvent::Done, state));
            }

            let rate = state.rate.load(Ordering::SeqCst).max(1);
            state.limiter.set_rate(rate);
            let per_step = (rate as u128 * state.step.as_millis() / 1000).max(1) as u64;
            let chunk = per_step.min(state.remaining);
            let wait = state.limiter.wait_if_needed(chunk);
            tokio::time::sleep(state.step.max(wait)).await;

            state.remaining -= chunk;
            Some((TransferEvent::Progress(chunk), state))
        }))
    }

    fn set_bandwidth(&self, handle: &TransferHandle, bytes_per_sec: u64) {
        if let Ok(controls) = self.controls.lock() {
            if let Some(control) = controls.get(handle) {
                control.bandwidth.store(bytes_per_sec, Ordering::SeqCst);
            }
        }
    }

    async fn stop(&self, handle: &TransferHandle) {
        if let Ok(mut controls) = self.controls.lock() {
            if let Some(control) = controls.remove(handle) {
                control.stopped.store(true, Ordering::SeqCst);
            }
        }
    }
}
