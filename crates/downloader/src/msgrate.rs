//! Message throughput estimation.
//!
//! Every peer gets a [`Tracker`] measuring how many items of each message
//! kind it delivers per second. [`Trackers`] aggregates them into a shared
//! round trip target so requests to all peers are sized to finish in
//! roughly the same time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Weight of a new measurement against the running estimate.
pub const MEASUREMENT_IMPACT: f64 = 0.1;

/// Overestimation of capacity so peers are probed for more than measured.
const CAPACITY_OVERESTIMATION: f64 = 1.01;

pub const RTT_MIN_ESTIMATE: Duration = Duration::from_secs(2);
pub const RTT_MAX_ESTIMATE: Duration = Duration::from_secs(20);

/// Factor pushing the target round trip below the median on each tuning.
const RTT_PUSHDOWN_FACTOR: f64 = 0.9;

const RTT_MIN_CONFIDENCE: f64 = 0.1;

/// Multiplier from target round trip to request timeout.
const TTL_SCALING: f64 = 3.0;

pub const TTL_LIMIT: Duration = Duration::from_secs(60);

/// Peer count above which losing one does not reduce confidence.
const TUNING_CONFIDENCE_CAP: usize = 10;

const TUNING_IMPACT: f64 = 0.25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("already tracking {0}")]
    AlreadyTracking(String),
    #[error("not tracking {0}")]
    NotTracking(String),
}

struct TrackerInner {
    capacity: HashMap<u64, f64>,
    roundtrip: Duration,
}

/// Per-peer throughput estimator keyed by message code.
pub struct Tracker {
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    pub fn new(capacity: HashMap<u64, f64>, roundtrip: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner { capacity, roundtrip }),
        }
    }

    /// Number of `kind` items the peer should deliver within `target_rtt`.
    pub fn capacity(&self, kind: u64, target_rtt: Duration) -> usize {
        let inner = self.inner.lock();
        let rate = inner.capacity.get(&kind).copied().unwrap_or(0.0);
        let throughput = rate * target_rtt.as_secs_f64();
        round_capacity(1.0 + CAPACITY_OVERESTIMATION * throughput)
    }

    /// Fold a measurement of `items` delivered in `elapsed` into the estimate.
    /// A zero delivery (timeout or unavailable data) resets the capacity.
    pub fn update(&self, kind: u64, elapsed: Duration, items: usize) {
        let mut inner = self.inner.lock();
        if items == 0 {
            inner.capacity.insert(kind, 0.0);
            return;
        }
        let elapsed = elapsed.max(Duration::from_nanos(1));
        let measured = items as f64 / elapsed.as_secs_f64();

        let old = inner.capacity.get(&kind).copied().unwrap_or(0.0);
        inner
            .capacity
            .insert(kind, (1.0 - MEASUREMENT_IMPACT) * old + MEASUREMENT_IMPACT * measured);
        inner.roundtrip = Duration::from_secs_f64(
            (1.0 - MEASUREMENT_IMPACT) * inner.roundtrip.as_secs_f64()
                + MEASUREMENT_IMPACT * elapsed.as_secs_f64(),
        );
    }

    pub fn roundtrip(&self) -> Duration {
        self.inner.lock().roundtrip
    }

    fn capacities(&self) -> HashMap<u64, f64> {
        self.inner.lock().capacity.clone()
    }
}

fn round_capacity(cap: f64) -> usize {
    cap.ceil().min(i32::MAX as f64) as usize
}

struct TrackersInner {
    trackers: HashMap<String, Arc<Tracker>>,
    roundtrip: Duration,
    confidence: f64,
    tuned: Instant,
}

/// The set of all peer trackers, giving the sync a common beat.
pub struct Trackers {
    inner: Mutex<TrackersInner>,
    ttl_limit: Duration,
}

impl Default for Trackers {
    fn default() -> Self {
        Self::new()
    }
}

impl Trackers {
    pub fn new() -> Self {
        Self::with_ttl_limit(TTL_LIMIT)
    }

    pub fn with_ttl_limit(ttl_limit: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackersInner {
                trackers: HashMap::new(),
                roundtrip: RTT_MAX_ESTIMATE,
                confidence: 1.0,
                tuned: Instant::now(),
            }),
            ttl_limit,
        }
    }

    pub fn track(&self, id: &str, tracker: Arc<Tracker>) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        if inner.trackers.contains_key(id) {
            return Err(TrackerError::AlreadyTracking(id.to_string()));
        }
        inner.trackers.insert(id.to_string(), tracker);
        detune(&mut inner);
        Ok(())
    }

    pub fn untrack(&self, id: &str) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        if inner.trackers.remove(id).is_none() {
            return Err(TrackerError::NotTracking(id.to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Average capacity per message kind across all tracked peers. Used to
    /// seed newly joined peers.
    pub fn mean_capacities(&self) -> HashMap<u64, f64> {
        let inner = self.inner.lock();
        let mut sums: HashMap<u64, f64> = HashMap::new();
        for tracker in inner.trackers.values() {
            for (kind, cap) in tracker.capacities() {
                *sums.entry(kind).or_default() += cap;
            }
        }
        let n = inner.trackers.len().max(1) as f64;
        sums.values_mut().for_each(|cap| *cap /= n);
        sums
    }

    pub fn median_round_trip(&self) -> Duration {
        median_round_trip(&self.inner.lock())
    }

    pub fn target_round_trip(&self) -> Duration {
        self.inner.lock().roundtrip
    }

    /// Timeout for a request sized to the target round trip, inflated when
    /// confidence in the estimate is low.
    pub fn target_timeout(&self) -> Duration {
        let inner = self.inner.lock();
        let ttl = TTL_SCALING * inner.roundtrip.as_secs_f64() / inner.confidence;
        Duration::from_secs_f64(ttl).min(self.ttl_limit)
    }

    pub fn confidence(&self) -> f64 {
        self.inner.lock().confidence
    }

    /// Move the round trip target toward the pushed-down median and regain
    /// confidence. Runs at most once per current target round trip.
    pub fn tune(&self) {
        let mut inner = self.inner.lock();
        if inner.tuned.elapsed() < inner.roundtrip {
            return;
        }
        inner.tuned = Instant::now();

        let median = median_round_trip(&inner).as_secs_f64();
        let target = (1.0 - TUNING_IMPACT) * inner.roundtrip.as_secs_f64()
            + TUNING_IMPACT * RTT_PUSHDOWN_FACTOR * median;
        inner.roundtrip = Duration::from_secs_f64(target).clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE);
        inner.confidence += (1.0 - inner.confidence) / 2.0;

        debug!(
            rtt = ?inner.roundtrip,
            confidence = inner.confidence,
            ttl = ?self.ttl_limit.min(Duration::from_secs_f64(
                TTL_SCALING * inner.roundtrip.as_secs_f64() / inner.confidence
            )),
            "recalculated msgrate QoS values"
        );
    }
}

fn median_round_trip(inner: &TrackersInner) -> Duration {
    let mut rtts: Vec<Duration> = inner.trackers.values().map(|t| t.roundtrip()).collect();
    if rtts.is_empty() {
        return RTT_MAX_ESTIMATE;
    }
    rtts.sort_unstable();
    rtts[rtts.len() / 2].clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE)
}

/// A new peer joining lowers confidence in the current target until it has
/// been measured.
fn detune(inner: &mut TrackersInner) {
    let peers = inner.trackers.len();
    if peers == 1 {
        inner.confidence = 1.0;
        return;
    }
    if peers >= TUNING_CONFIDENCE_CAP {
        return;
    }
    inner.confidence = (inner.confidence * (peers - 1) as f64 / peers as f64).max(RTT_MIN_CONFIDENCE);
}
