// Throughput Tracker: Sliding-window speed and ETA estimation.
//
// Completed transfers are bucketed by completion time and expire after the
// window. Transfers still in flight contribute their running average rate
// once they have been active for at least a second.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(5);
const WARMUP: Duration = Duration::from_secs(1);

/// Identifier of a transfer registered with [`ThroughputTracker::begin_transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

#[derive(Debug, Default, Clone, Copy)]
struct CompletedBucket {
    bytes: u64,
    blocks: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    started: Instant,
    bytes: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    window_start: Option<Instant>,
    total_blocks: u64,
    done_blocks: u64,
    completed: BTreeMap<Instant, CompletedBucket>,
    in_flight: HashMap<TransferId, InFlight>,
    next_id: u64,
}

/// Speed and remaining-time estimate at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl Throughput {
    /// Render as e.g. `1.50 MB/s, ETA 01:05`.
    pub fn to_text(&self) -> String {
        match self.eta {
            Some(eta) => format!(
                "{}, ETA {}",
                format_speed(self.bytes_per_second),
                format_eta(eta)
            ),
            None => format_speed(self.bytes_per_second),
        }
    }
}

#[derive(Debug, Default)]
pub struct ThroughputTracker {
    state: Mutex<TrackerState>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new measuring window and forget all recorded transfers.
    pub fn reset(&self, total_blocks: u64, now: Instant) {
        let mut state = self.state.lock();
        state.window_start = Some(now);
        state.total_blocks = total_blocks;
        state.done_blocks = 0;
        state.completed.clear();
        state.in_flight.clear();
    }

    /// Record one finished block of `bytes` at `at`.
    pub fn record_completed(&self, at: Instant, bytes: u64) {
        let mut state = self.state.lock();
        let bucket = state.completed.entry(at).or_default();
        bucket.bytes += bytes;
        bucket.blocks += 1;
        state.done_blocks += 1;
    }

    pub fn begin_transfer(&self, at: Instant) -> TransferId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = TransferId(state.next_id);
        state.in_flight.insert(
            id,
            InFlight {
                started: at,
                bytes: 0,
            },
        );
        id
    }

    pub fn record_in_flight(&self, id: TransferId, bytes_so_far: u64) {
        if let Some(transfer) = self.state.lock().in_flight.get_mut(&id) {
            transfer.bytes = bytes_so_far;
        }
    }

    pub fn finish_transfer(&self, id: TransferId) {
        self.state.lock().in_flight.remove(&id);
    }

    pub fn done_blocks(&self) -> u64 {
        self.state.lock().done_blocks
    }

    /// Completed fraction in percent, 0 when the total is unknown.
    pub fn percent(&self) -> u8 {
        let state = self.state.lock();
        if state.total_blocks == 0 {
            return 0;
        }
        (state.done_blocks.min(state.total_blocks) * 100 / state.total_blocks) as u8
    }

    /// Current estimate, or `None` during the first second of the window.
    pub fn speed_and_eta(&self, now: Instant) -> Option<Throughput> {
        let mut state = self.state.lock();
        let elapsed = now.checked_duration_since(state.window_start?)?;
        if elapsed < WARMUP {
            return None;
        }

        if let Some(expire) = now.checked_sub(WINDOW) {
            state.completed = state.completed.split_off(&expire);
        }

        let (bytes, blocks) = state
            .completed
            .values()
            .fold((0u64, 0u64), |(bytes, blocks), bucket| {
                (bytes + bucket.bytes, blocks + bucket.blocks)
            });

        let window = elapsed.min(WINDOW).as_secs_f64();
        let mut bytes_per_second = bytes as f64 / window;
        for transfer in state.in_flight.values() {
            let active = now.saturating_duration_since(transfer.started);
            if active >= WARMUP {
                bytes_per_second += transfer.bytes as f64 / active.as_secs_f64();
            }
        }

        let eta = (state.total_blocks > 0 && blocks > 0 && state.done_blocks < state.total_blocks)
            .then(|| {
                let seconds_per_block = window / blocks as f64;
                let remaining = (state.total_blocks - state.done_blocks) as f64;
                Duration::from_secs((seconds_per_block * remaining) as u64)
            });

        Some(Throughput {
            bytes_per_second,
            eta,
        })
    }
}

/// Format a rate as `N B/s`, `N KB/s` or `N.NN MB/s`.
pub fn format_speed(bytes_per_second: f64) -> String {
    if bytes_per_second < 1024.0 {
        return format!("{} B/s", bytes_per_second as u64);
    }
    let kib = bytes_per_second / 1024.0;
    if kib < 1024.0 {
        return format!("{} KB/s", kib as u64);
    }
    format!("{:.2} MB/s", kib / 1024.0)
}

/// Format a duration as `MM:SS`; minutes are not wrapped into hours.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
