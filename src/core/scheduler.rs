use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::LookupError;

/// 单次赋值的失败槽：首个失败胜出，之后的失败只记日志
#[derive(Default)]
pub struct FailureSlot {
    cause: ArcSwapOption<LookupError>,
}

impl FailureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 true 表示本次写入成功（槽之前为空）
    pub fn record(&self, err: LookupError) -> bool {
        let empty: Option<Arc<LookupError>> = None;
        let prev = self.cause.compare_and_swap(&empty, Some(Arc::new(err)));
        prev.is_none()
    }

    pub fn get(&self) -> Option<Arc<LookupError>> {
        self.cause.load_full()
    }

    pub fn is_set(&self) -> bool {
        self.cause.load().is_some()
    }
}

/// 固定延迟的后台刷新线程
///
/// - 启动即执行一次，之后每次在上一轮结束后再等 `interval`（fixed delay，不是 fixed rate）。
/// - 单线程串行执行，任意时刻至多一轮在跑。
/// - 任务返回错误或 panic：写入 `FailureSlot`，调度继续。
pub struct RefreshScheduler {
    name: String,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn start<F>(
        name: &str,
        interval: Duration,
        slot: Arc<FailureSlot>,
        mut task: F,
    ) -> Result<Self, LookupError>
    where
        F: FnMut() -> Result<(), LookupError> + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        // worker 退出时 drop 掉 done_tx，stop() 据此判断是否已结束
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let worker_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("refresh-{name}"))
            .spawn(move || {
                let _done = done_tx;
                loop {
                    let started = Instant::now();
                    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(r) => r,
                        Err(payload) => Err(LookupError::RefreshPanicked(panic_message(&payload))),
                    };

                    if let Err(e) = outcome {
                        let msg = e.to_string();
                        if slot.record(e) {
                            tracing::error!(
                                "Refresh of {} failed after {:?}, cache marked unusable: {}",
                                worker_name,
                                started.elapsed(),
                                msg
                            );
                        } else {
                            tracing::warn!(
                                "Refresh of {} failed again (first failure kept): {}",
                                worker_name,
                                msg
                            );
                        }
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::debug!("Refresh worker {} exited", worker_name);
            })
            .map_err(LookupError::WorkerSpawn)?;

        tracing::info!(
            "Refresh scheduler started: {} (interval={:?})",
            name,
            interval
        );

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    /// 停止调度；最多等 `grace`，卡住的一轮被分离（detach）
    ///
    /// 返回 true 表示 worker 已退出。
    pub fn stop(&mut self, grace: Duration) -> bool {
        drop(self.stop_tx.take());
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done_rx.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Refresh worker {} still busy after {:?}, detaching",
                    self.name,
                    grace
                );
                false
            }
            _ => {
                let _ = handle.join();
                tracing::info!("Refresh scheduler stopped: {}", self.name);
                true
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(Duration::ZERO);
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
