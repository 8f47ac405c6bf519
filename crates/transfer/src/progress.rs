use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Receives byte-count updates while a transfer runs.
///
/// Called synchronously from the controller's update path after each
/// uploaded part, so implementations must return quickly and never block.
/// Whatever a sink does, including panicking, has no effect on the transfer.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, session_id: &str, uploaded_bytes: u64, total_bytes: u64);
}

/// A single progress notification as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub session_id: String,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

impl ProgressUpdate {
    /// Returns the progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_progress(&self, _session_id: &str, _uploaded_bytes: u64, _total_bytes: u64) {}
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(&str, u64, u64) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&str, u64, u64) + Send + Sync,
{
    fn on_progress(&self, session_id: &str, uploaded_bytes: u64, total_bytes: u64) {
        (self.0)(session_id, uploaded_bytes, total_bytes)
    }
}

/// Forwards updates into a bounded channel without waiting.
///
/// When the receiver lags and the channel is full the update is dropped;
/// a later update carries a larger byte count anyway.
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_progress(&self, session_id: &str, uploaded_bytes: u64, total_bytes: u64) {
        let update = ProgressUpdate {
            session_id: session_id.to_string(),
            uploaded_bytes,
            total_bytes,
        };
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(u)) => {
                trace!(session = %u.session_id, uploaded = u.uploaded_bytes, "progress channel full, update dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_SPEED_SAMPLES: usize = 100;

/// Throughput estimate over a sliding window of progress observations.
///
/// Fed the cumulative byte count a sink receives. The rate is the bytes
/// gained between the oldest and newest observation in the window divided
/// by the time between them, so the count already present at the first
/// observation (e.g. parts kept from a resumed session) is never counted
/// as throughput.
pub struct SpeedCalculator {
    window: Duration,
    capacity: usize,
    observations: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW, DEFAULT_SPEED_SAMPLES)
    }
}

impl SpeedCalculator {
    /// `window` bounds how far back observations count; `capacity` bounds
    /// how many are kept (at least two).
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window,
            capacity,
            observations: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Records the cumulative byte count at the current instant.
    pub fn observe(&self, uploaded_bytes: u64) {
        self.observe_at(Instant::now(), uploaded_bytes);
    }

    fn observe_at(&self, at: Instant, uploaded_bytes: u64) {
        let mut obs = self.observations.lock().unwrap_or_else(PoisonError::into_inner);
        obs.push_back((at, uploaded_bytes));
        while obs.len() > self.capacity {
            obs.pop_front();
        }
        // The newest observation always stays.
        while obs.len() > 1
            && obs
                .front()
                .is_some_and(|&(t, _)| at.duration_since(t) > self.window)
        {
            obs.pop_front();
        }
    }

    /// Bytes per second across the window; 0.0 until two observations at
    /// different instants exist.
    pub fn bytes_per_second(&self) -> f64 {
        let obs = self.observations.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (obs.front(), obs.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        b1.saturating_sub(b0) as f64 / elapsed
    }

    /// Time left for `remaining_bytes` at the current rate, if any.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }

    pub fn reset(&self) {
        self.observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
