#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::paged_attention::KvCacheInfo;

pub struct IntervalLogger {
    enable_logging: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    tokens_processed: Arc<AtomicUsize>,
    num_running: Arc<AtomicUsize>,
    num_waiting: Arc<AtomicUsize>,
    preemptions: Arc<AtomicUsize>,
    used_blocks: Arc<AtomicUsize>,
    total_blocks: Arc<AtomicUsize>,
}

impl IntervalLogger {
    /// Starts an interval logger. Call `enable_logging` to begin the logging process.
    pub fn new(interval: Duration) -> Self {
        let enable_logging = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let tokens_processed = Arc::new(AtomicUsize::new(0));
        let num_running = Arc::new(AtomicUsize::new(0));
        let num_waiting = Arc::new(AtomicUsize::new(0));
        let preemptions = Arc::new(AtomicUsize::new(0));
        let used_blocks = Arc::new(AtomicUsize::new(0));
        let total_blocks = Arc::new(AtomicUsize::new(0));

        let t_enable_logging = enable_logging.clone();
        let t_stopped = stopped.clone();
        let t_tokens_processed = tokens_processed.clone();
        let t_num_running = num_running.clone();
        let t_num_waiting = num_waiting.clone();
        let t_preemptions = preemptions.clone();
        let t_used_blocks = used_blocks.clone();
        let t_total_blocks = total_blocks.clone();
        thread::spawn(move || {
            while !t_stopped.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if !t_enable_logging.load(Ordering::Relaxed) {
                    continue;
                }

                let tokens_processed = t_tokens_processed.swap(0, Ordering::Relaxed);
                let num_running = t_num_running.load(Ordering::Relaxed);
                let num_waiting = t_num_waiting.load(Ordering::Relaxed);
                let preemptions = t_preemptions.load(Ordering::Relaxed);
                let used = t_used_blocks.load(Ordering::Relaxed);
                let total = t_total_blocks.load(Ordering::Relaxed).max(1);

                if tokens_processed != 0 || num_running != 0 || num_waiting != 0 {
                    // Prefill and decode tokens of this window only; the counter
                    // is swapped to 0 every interval.
                    info!(
                        "Throughput (T/s) {:.2}, KV cache {:.2}% used, {num_running} running, {num_waiting} waiting, {preemptions} preemptions",
                        tokens_processed as f64 / interval.as_secs_f64(),
                        100. * used as f64 / total as f64,
                    );
                }
            }
        });

        Self {
            enable_logging,
            stopped,
            tokens_processed,
            num_running,
            num_waiting,
            preemptions,
            used_blocks,
            total_blocks,
        }
    }

    pub fn enable_logging(&self) {
        self.enable_logging.store(true, Ordering::Relaxed);
    }

    pub fn add_tokens_processed(&self, num_tokens: usize) {
        self.tokens_processed
            .fetch_add(num_tokens, Ordering::Relaxed);
    }

    pub fn set_num_running(&self, running: usize) {
        self.num_running.store(running, Ordering::Relaxed);
    }

    pub fn set_num_waiting(&self, waiting: usize) {
        self.num_waiting.store(waiting, Ordering::Relaxed);
    }

    pub fn set_preemptions(&self, preemptions: usize) {
        self.preemptions.store(preemptions, Ordering::Relaxed);
    }

    pub fn set_cache_info(&self, info: &KvCacheInfo) {
        self.used_blocks.store(info.used_blocks, Ordering::Relaxed);
        self.total_blocks.store(info.total_blocks, Ordering::Relaxed);
    }
}

impl Drop for IntervalLogger {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
