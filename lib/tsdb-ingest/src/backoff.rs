use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info};

/// Default capacity of the backoff signal channel.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 100;

/// Time spent backing off over a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackoffTotals {
    /// Total length of every congested interval.
    pub total: Duration,

    /// Number of contiguous congested intervals.
    pub intervals: usize,
}

/// Accumulates the time spent in a congested state.
///
/// Fed with a chronological stream of congested/clear observations, this sums the length of every contiguous run of
/// congested observations: from the first `true` after a `false` (or the start) until the next `false`.
#[derive(Debug, Default)]
pub struct BackoffAccumulator {
    congested_since: Option<Instant>,
    total: Duration,
    intervals: usize,
}

impl BackoffAccumulator {
    /// Records an observation made at `now`.
    ///
    /// Returns the length of the congested interval if this observation closed one.
    pub fn observe(&mut self, congested: bool, now: Instant) -> Option<Duration> {
        match (congested, self.congested_since) {
            (true, None) => {
                self.congested_since = Some(now);
                None
            }
            (false, Some(start)) => {
                self.congested_since = None;
                let took = now.saturating_duration_since(start);
                self.total += took;
                self.intervals += 1;
                Some(took)
            }
            _ => None,
        }
    }

    /// Closes any open congested interval at `now` and returns the grand totals.
    pub fn finish(mut self, now: Instant) -> BackoffTotals {
        if self.congested_since.is_some() {
            self.observe(false, now);
        }
        BackoffTotals {
            total: self.total,
            intervals: self.intervals,
        }
    }

    /// Returns the total time spent congested in closed intervals so far.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Returns the number of closed congested intervals so far.
    pub fn intervals(&self) -> usize {
        self.intervals
    }
}

/// Handle for signalling backpressure state to the tracker.
///
/// `true` means the target is pushing back, `false` means writes are going through. Cloned into every worker.
#[derive(Clone)]
pub struct BackoffSignal {
    tx: mpsc::Sender<(bool, Instant)>,
}

impl BackoffSignal {
    /// Signals the current backpressure state.
    ///
    /// The observation is timestamped here, not when the tracker gets to it. If the tracker has already stopped, the
    /// signal is dropped.
    pub async fn signal(&self, congested: bool) {
        if self.tx.send((congested, Instant::now())).await.is_err() {
            debug!(congested, "Backoff tracker stopped; dropping signal.");
        }
    }
}

/// Aggregates backpressure signals from every worker into a single running total.
pub struct BackoffTracker {
    handle: JoinHandle<BackoffTotals>,
}

impl BackoffTracker {
    /// Spawns the tracker task, returning the signal handle to hand out to workers.
    ///
    /// The tracker runs until every clone of the returned [`BackoffSignal`] has been dropped.
    pub fn spawn(capacity: usize) -> (BackoffSignal, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_tracker(rx));
        (BackoffSignal { tx }, Self { handle })
    }

    /// Waits for the tracker to finish and returns the time spent backing off.
    ///
    /// Every [`BackoffSignal`] must be dropped first, otherwise this waits forever.
    pub async fn wait(self) -> BackoffTotals {
        // The tracker task never panics, so a join error can only mean it was cancelled with the runtime.
        self.handle.await.unwrap_or_default()
    }
}

async fn run_tracker(mut rx: mpsc::Receiver<(bool, Instant)>) -> BackoffTotals {
    let mut accumulator = BackoffAccumulator::default();
    while let Some((congested, observed_at)) = rx.recv().await {
        if let Some(took) = accumulator.observe(congested, observed_at) {
            info!("Backoff took {:.02}sec.", took.as_secs_f64());
        }
    }

    let totals = accumulator.finish(Instant::now());
    info!(
        intervals = totals.intervals,
        "Backoffs took a total of {:.06}sec of runtime.",
        totals.total.as_secs_f64()
    );
    totals
}
