//! Throughput accounting for active transfers.
//!
//! Sessions feed `(instant, cumulative bytes)` samples; the tracker turns them
//! into an instantaneous speed, a smoothed speed (what the user sees) and an
//! ETA. Samples live in a bounded per-session ring buffer and are discarded
//! when the session ends.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::transfer::session::TransferId;

/// Samples kept per session
pub const SAMPLE_CAPACITY: usize = 64;

/// Samples older than this (relative to the newest) are dropped
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(10);

/// Time constant of the exponential smoothing
const SMOOTHING_TAU_SECS: f64 = 2.0;

/// No new bytes for this long means the transfer is stalled
const STALL_AFTER: Duration = Duration::from_secs(3);

/// Speeds below this are reported as zero
const MIN_SPEED_BPS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    pub at: Instant,
    pub cumulative_bytes: u64,
}

#[derive(Debug)]
struct SampleWindow {
    total_size: u64,
    samples: VecDeque<ThroughputSample>,
    smoothed: Option<f64>,
    /// Rate over the last positive interval
    instantaneous: Option<f64>,
    /// Cumulative bytes the next rate is measured from. Bytes folded into
    /// a same-instant sample stay above it until a later sample counts them.
    rate_base: u64,
    last_advance: Option<Instant>,
}

impl SampleWindow {
    fn new(total_size: u64) -> Self {
        Self {
            total_size,
            samples: VecDeque::with_capacity(SAMPLE_CAPACITY),
            smoothed: None,
            instantaneous: None,
            rate_base: 0,
            last_advance: None,
        }
    }

    fn push(&mut self, at: Instant, cumulative_bytes: u64) {
        let Some(last) = self.samples.back_mut() else {
            self.samples.push_back(ThroughputSample { at, cumulative_bytes });
            self.rate_base = cumulative_bytes;
            self.last_advance = Some(at);
            return;
        };

        // Counters never go backwards
        let bytes = cumulative_bytes.max(last.cumulative_bytes);
        let at = at.max(last.at);
        let dt = at.duration_since(last.at).as_secs_f64();

        if dt <= 0.0 {
            // Same instant: fold into the previous sample
            if bytes > last.cumulative_bytes {
                last.cumulative_bytes = bytes;
                self.last_advance = Some(at);
            }
            return;
        }

        let rate = (bytes - self.rate_base) as f64 / dt;
        self.rate_base = bytes;
        self.instantaneous = Some(rate);
        let alpha = 1.0 - (-dt / SMOOTHING_TAU_SECS).exp();
        self.smoothed = Some(match self.smoothed {
            None => rate,
            Some(prev) => prev + alpha * (rate - prev),
        });
        if bytes > last.cumulative_bytes {
            self.last_advance = Some(at);
        }

        self.samples.push_back(ThroughputSample {
            at,
            cumulative_bytes: bytes,
        });
        while self.samples.len() > SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        while self.samples.len() > 2
            && self
                .samples
                .front()
                .is_some_and(|s| at.duration_since(s.at) > SAMPLE_WINDOW)
        {
            self.samples.pop_front();
        }
    }

    fn latest(&self) -> Option<ThroughputSample> {
        self.samples.back().copied()
    }

    fn instantaneous(&self) -> Option<f64> {
        self.instantaneous
    }

    fn smoothed(&self) -> Option<f64> {
        let speed = self.smoothed?;
        let latest = self.latest()?;
        let stalled = self
            .last_advance
            .is_some_and(|t| latest.at.duration_since(t) >= STALL_AFTER);
        if stalled || speed < MIN_SPEED_BPS {
            Some(0.0)
        } else {
            Some(speed)
        }
    }

    fn eta(&self) -> Option<Duration> {
        let latest = self.latest()?;
        let remaining = self.total_size.saturating_sub(latest.cumulative_bytes);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        match self.smoothed() {
            Some(speed) if speed > 0.0 => Some(Duration::from_secs_f64(remaining as f64 / speed)),
            _ => None,
        }
    }
}

/// Per-session throughput windows keyed by transfer id
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    sessions: HashMap<TransferId, SampleWindow>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a session of `total_size` bytes
    pub fn register(&mut self, session_id: TransferId, total_size: u64) {
        self.sessions
            .insert(session_id, SampleWindow::new(total_size));
    }

    /// Discard all samples of a session
    pub fn remove(&mut self, session_id: &TransferId) {
        self.sessions.remove(session_id);
    }

    /// Append a sample; unknown sessions are ignored
    pub fn record_sample(&mut self, session_id: &TransferId, at: Instant, cumulative_bytes: u64) {
        if let Some(window) = self.sessions.get_mut(session_id) {
            window.push(at, cumulative_bytes);
        }
    }

    /// Bytes per second between the two most recent samples
    pub fn instantaneous_speed(&self, session_id: &TransferId) -> Option<f64> {
        self.sessions.get(session_id)?.instantaneous()
    }

    /// Exponentially smoothed bytes per second; the value shown to the user
    pub fn smoothed_speed(&self, session_id: &TransferId) -> Option<f64> {
        self.sessions.get(session_id)?.smoothed()
    }

    /// Time remaining, `None` when unknown (no samples yet or stalled)
    pub fn eta(&self, session_id: &TransferId) -> Option<Duration> {
        self.sessions.get(session_id)?.eta()
    }

    pub fn sample_count(&self, session_id: &TransferId) -> usize {
        self.sessions
            .get(session_id)
            .map_or(0, |w| w.samples.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Tracker shared between the manager and its sessions
#[derive(Debug, Clone, Default)]
pub struct SharedTracker(Arc<Mutex<ThroughputTracker>>);

impl SharedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ThroughputTracker> {
        // Critical sections never panic midway, so a poisoned lock is still consistent
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session and return a handle that unregisters it on drop
    pub fn track(&self, session_id: TransferId, total_size: u64) -> TrackerHandle {
        self.lock().register(session_id, total_size);
        TrackerHandle {
            tracker: self.clone(),
            session_id,
        }
    }
}

/// Metrics derived for one session at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpeedReport {
    pub instantaneous: Option<f64>,
    pub smoothed: Option<f64>,
    pub eta: Option<Duration>,
}

/// A session's view of the tracker
#[derive(Debug)]
pub struct TrackerHandle {
    tracker: SharedTracker,
    session_id: TransferId,
}

impl TrackerHandle {
    pub fn record(&self, at: Instant, cumulative_bytes: u64) {
        self.tracker
            .lock()
            .record_sample(&self.session_id, at, cumulative_bytes);
    }

    pub fn report(&self) -> SpeedReport {
        let tracker = self.tracker.lock();
        SpeedReport {
            instantaneous: tracker.instantaneous_speed(&self.session_id),
            smoothed: tracker.smoothed_speed(&self.session_id),
            eta: tracker.eta(&self.session_id),
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.session_id);
    }
}
