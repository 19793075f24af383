//! Display feed: hands finalized bursts to the rendering side.
//!
//! Producers (the accumulator, usually on a decode thread) call
//! [`DisplayFeed::publish`], which only enqueues and never waits on the
//! renderer. A single drain pass at a time delivers queued records in
//! publish order; the `draining` flag is the single-flight guard.
//!
//! # Wake-up protocol
//! A publisher pushes first, then tries to claim the flag. The drain clears
//! the flag only after seeing an empty queue and then re-checks the queue,
//! reclaiming the flag if something arrived in between. Either the running
//! drain or the publisher's own claim therefore delivers every record.

use crate::burst::WaveBurst;
use crate::error::AppResult;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{trace, warn};

/// Rendering collaborator (chart/table population).
pub trait BurstRenderer: Send + Sync {
    /// Render one validated burst.
    fn render(&self, burst: &WaveBurst) -> AppResult<()>;
}

struct FeedInner {
    queue: Mutex<VecDeque<Arc<WaveBurst>>>,
    draining: AtomicBool,
    renderer: Arc<dyn BurstRenderer>,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

impl FeedInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<WaveBurst>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn drain(&self) {
        loop {
            loop {
                // Pop under the lock, render outside it.
                let next = self.queue().pop_front();
                let Some(record) = next else { break };
                self.deliver(&record);
            }

            self.draining.store(false, Ordering::Release);
            if self.queue().is_empty() || !self.try_claim() {
                return;
            }
        }
    }

    fn deliver(&self, record: &WaveBurst) {
        if record.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(output = record.output_name(), "Skipping burst with no samples");
            return;
        }
        match self.renderer.render(record) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                trace!(output = record.output_name(), "Burst rendered");
            }
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(output = record.output_name(), error = %err, "Renderer rejected burst");
            }
        }
    }
}

/// Unbounded, thread-safe feed of finalized bursts.
pub struct DisplayFeed {
    inner: Arc<FeedInner>,
    runtime: Option<Handle>,
}

impl DisplayFeed {
    /// Create a feed delivering to `renderer`.
    ///
    /// Drains run on the Tokio blocking pool when created inside a runtime,
    /// otherwise on a short-lived thread.
    pub fn new(renderer: Arc<dyn BurstRenderer>) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                renderer,
                delivered: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Enqueue `record` and wake a drain if none is running.
    pub fn publish(&self, record: Arc<WaveBurst>) {
        self.inner.queue().push_back(record);
        if self.inner.try_claim() {
            let inner = Arc::clone(&self.inner);
            match &self.runtime {
                Some(handle) => {
                    handle.spawn_blocking(move || inner.drain());
                }
                None => {
                    std::thread::spawn(move || inner.drain());
                }
            }
        }
    }

    /// Records waiting for a drain.
    pub fn pending(&self) -> usize {
        self.inner.queue().len()
    }

    /// True while a drain pass holds the single-flight flag.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Records handed to the renderer successfully.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Records skipped by validation or refused by the renderer.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaveError;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelRenderer(Mutex<mpsc::Sender<String>>);

    impl BurstRenderer for ChannelRenderer {
        fn render(&self, burst: &WaveBurst) -> AppResult<()> {
            if burst.output_name().contains("bad") {
                return Err(WaveError::Render("refused".into()));
            }
            self.0
                .lock()
                .unwrap()
                .send(burst.output_name().to_string())
                .map_err(|e| WaveError::Render(e.to_string()))
        }
    }

    fn burst(name: &str, samples: usize) -> Arc<WaveBurst> {
        let json = serde_json::json!({
            "output_name": name,
            "serial_number": "SN",
            "first_timestamp": "2024-01-01T00:00:00",
            "samples": (0..samples).map(|i| serde_json::json!({
                "ensemble_number": i,
                "timestamp": "2024-01-01T00:00:00",
                "pressure": 1.0,
                "ranges": [1.0],
                "velocities": [[0.1]],
                "correlations": [[0.9]],
            })).collect::<Vec<_>>(),
        });
        Arc::new(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn drains_without_runtime_and_skips_bad_records() {
        let (tx, rx) = mpsc::channel();
        let feed = DisplayFeed::new(Arc::new(ChannelRenderer(Mutex::new(tx))));

        feed.publish(burst("a", 1));
        feed.publish(burst("empty", 0));
        feed.publish(burst("bad", 2));
        feed.publish(burst("b", 3));

        let got: Vec<String> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);

        // Let the drain finish its bookkeeping.
        for _ in 0..100 {
            if !feed.is_draining() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(feed.delivered(), 2);
        assert_eq!(feed.rejected(), 2);
        assert_eq!(feed.pending(), 0);
    }
}
