//! Progress reporting with time-based throttling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::types::TransferProgress;

/// Minimum gap between two throttled progress events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(50);

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Emits progress events for one transfer attempt.
///
/// `update` drops events that arrive within [`PROGRESS_INTERVAL`] of the
/// previous one; `finish` always emits so the 100% event is never lost.
/// Reported byte counts never decrease. Events fire under an internal lock,
/// so callbacks observe them in order and should return quickly.
pub struct ProgressReporter {
    transfer_id: String,
    total_bytes: u64,
    callback: Option<ProgressCallback>,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    started: Instant,
    last_emit: Instant,
    last_bytes: u64,
    baseline: u64,
}

impl ProgressReporter {
    /// `baseline` is the byte count the attempt starts from; resumed
    /// transfers pass the snapshot offset so speed covers new bytes only.
    pub fn new(
        transfer_id: impl Into<String>,
        total_bytes: u64,
        baseline: u64,
        callback: Option<ProgressCallback>,
    ) -> Self {
        let now = Instant::now();
        Self {
            transfer_id: transfer_id.into(),
            total_bytes,
            callback,
            state: Mutex::new(ReporterState {
                started: now,
                // Backdate so the first update goes straight through.
                last_emit: now.checked_sub(PROGRESS_INTERVAL).unwrap_or(now),
                last_bytes: baseline,
                baseline,
            }),
        }
    }

    /// Throttled update with the cumulative byte count.
    pub fn update(&self, transferred: u64) {
        let mut state = self.state.lock().unwrap();
        if transferred < state.last_bytes {
            return;
        }
        let now = Instant::now();
        if now.duration_since(state.last_emit) < PROGRESS_INTERVAL {
            return;
        }
        self.emit(&mut state, transferred, now, false);
    }

    /// Unthrottled update. Used where every read is a meaningful step,
    /// like the single-put upload path.
    pub fn update_now(&self, transferred: u64) {
        let mut state = self.state.lock().unwrap();
        if transferred < state.last_bytes {
            return;
        }
        let now = Instant::now();
        self.emit(&mut state, transferred, now, false);
    }

    /// Final event. Always emits, before the engine returns completion.
    pub fn finish(&self, transferred: u64) {
        let mut state = self.state.lock().unwrap();
        let transferred = transferred.max(state.last_bytes);
        let now = Instant::now();
        self.emit(&mut state, transferred, now, true);
    }

    fn emit(&self, state: &mut ReporterState, transferred: u64, now: Instant, finished: bool) {
        state.last_emit = now;
        state.last_bytes = transferred;

        if let Some(callback) = &self.callback {
            let percent = if finished {
                100
            } else if self.total_bytes == 0 {
                0
            } else {
                let pct = (transferred as f64 / self.total_bytes as f64 * 100.0).round() as u32;
                pct.min(100)
            };
            let elapsed = state.started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                transferred.saturating_sub(state.baseline) as f64 / elapsed
            } else {
                0.0
            };
            callback(TransferProgress {
                transfer_id: self.transfer_id.clone(),
                transferred_bytes: transferred,
                total_bytes: self.total_bytes,
                percent,
                speed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn collecting_reporter(total: u64) -> (ProgressReporter, Arc<Mutex<Vec<TransferProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
        let reporter = ProgressReporter::new("t-1", total, 0, Some(callback));
        (reporter, events)
    }

    #[test]
    fn first_update_emits_immediately() {
        let (reporter, events) = collecting_reporter(100);
        reporter.update(10);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn rapid_updates_are_throttled() {
        let (reporter, events) = collecting_reporter(1000);
        reporter.update(10);
        reporter.update(20);
        reporter.update(30);
        assert_eq!(events.lock().unwrap().len(), 1);

        sleep(PROGRESS_INTERVAL + Duration::from_millis(10));
        reporter.update(40);
        assert_eq!(events.lock().unwrap().len(), 2);
        assert_eq!(events.lock().unwrap()[1].transferred_bytes, 40);
    }

    #[test]
    fn update_now_skips_the_throttle() {
        let (reporter, events) = collecting_reporter(100);
        reporter.update_now(10);
        reporter.update_now(20);
        reporter.update_now(30);
        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[test]
    fn finish_always_emits_full_percent() {
        let (reporter, events) = collecting_reporter(100);
        reporter.update(10);
        reporter.finish(100);
        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.transferred_bytes, 100);
        assert_eq!(last.percent, 100);
    }

    #[test]
    fn byte_counts_never_decrease() {
        let (reporter, events) = collecting_reporter(100);
        reporter.update_now(50);
        reporter.update_now(40);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transferred_bytes, 50);
    }

    #[test]
    fn unknown_total_reports_zero_percent_until_finish() {
        let (reporter, events) = collecting_reporter(0);
        reporter.update_now(10);
        reporter.finish(10);
        let events = events.lock().unwrap();
        assert_eq!(events[0].percent, 0);
        assert_eq!(events.last().unwrap().percent, 100);
    }

    #[test]
    fn resumed_baseline_keeps_counts_monotonic() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
        let reporter = ProgressReporter::new("t-2", 100, 60, Some(callback));
        reporter.update_now(50);
        reporter.update_now(70);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transferred_bytes, 70);
    }
}
