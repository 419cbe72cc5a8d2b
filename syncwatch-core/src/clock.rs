//! Clock offset estimation between peers
//!
//! A viewer probes its reference peer (the host) with `clock-ping` messages and
//! turns every `clock-pong` into an NTP-style offset/RTT sample. The offset is
//! exponentially smoothed, and the stability of recent RTTs yields a confidence
//! figure that gates corrective playback actions downstream.
//!
//! The estimate assumes the forward and return paths take the same time.
//! Asymmetric routing shows up as a constant error in the offset and is not
//! compensated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of samples kept in the ring buffer
pub const MAX_SAMPLES: usize = 20;

/// Weight of the newest offset in the exponential smoothing
const SMOOTHING_ALPHA: f64 = 0.3;

/// Samples required before a confidence figure is produced
const MIN_SAMPLES_FOR_CONFIDENCE: usize = 5;

/// How many recent RTTs feed the confidence computation
const CONFIDENCE_WINDOW: usize = 10;

/// RTT standard deviation (ms) at which confidence drops to zero
const CONFIDENCE_STDDEV_SCALE_MS: f64 = 100.0;

/// Source of wall-clock time in epoch milliseconds
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// A clock that only moves when told to. Used to drive timers deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single offset measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Remote clock minus local clock, in milliseconds
    pub offset_ms: f64,
    /// Round-trip time excluding remote processing, in milliseconds
    pub rtt_ms: f64,
    /// Local time the reply was received
    pub timestamp_ms: u64,
}

/// Estimates the wall-clock offset to a reference peer
#[derive(Debug, Default)]
pub struct ClockOffsetEstimator {
    samples: VecDeque<ClockSample>,
    offset_ms: f64,
    confidence: f64,
    reference_peer: Option<String>,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            ..Default::default()
        }
    }

    /// Point the estimator at a (possibly new) reference peer.
    /// Switching to a different peer discards everything learned so far.
    pub fn set_reference(&mut self, peer_id: &str) {
        if self.reference_peer.as_deref() != Some(peer_id) {
            self.reset();
            self.reference_peer = Some(peer_id.to_string());
        }
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference_peer.as_deref()
    }

    /// Clear all samples and the reference peer
    pub fn reset(&mut self) {
        self.samples.clear();
        self.offset_ms = 0.0;
        self.confidence = 0.0;
        self.reference_peer = None;
    }

    /// Record a probe reply.
    ///
    /// `local_send` is the timestamp we put in the ping, `remote_receive` and
    /// `remote_send` come from the pong, `local_receive` is our clock on arrival.
    /// Returns `None` if the timestamps are not causally ordered.
    pub fn on_probe_reply(
        &mut self,
        local_send: u64,
        remote_receive: u64,
        remote_send: u64,
        local_receive: u64,
    ) -> Option<ClockSample> {
        if local_receive < local_send || remote_send < remote_receive {
            tracing::debug!(
                "Discarding clock sample with unordered timestamps (local {}..{}, remote {}..{})",
                local_send,
                local_receive,
                remote_receive,
                remote_send
            );
            return None;
        }

        let local_elapsed = (local_receive - local_send) as f64;
        let remote_elapsed = (remote_send - remote_receive) as f64;
        let rtt_ms = local_elapsed - remote_elapsed;
        if rtt_ms < 0.0 {
            tracing::debug!("Discarding clock sample with negative RTT {}ms", rtt_ms);
            return None;
        }

        let offset_ms = ((remote_receive as f64 - local_send as f64)
            + (remote_send as f64 - local_receive as f64))
            / 2.0;

        let sample = ClockSample {
            offset_ms,
            rtt_ms,
            timestamp_ms: local_receive,
        };

        if self.samples.len() >= MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        self.offset_ms = SMOOTHING_ALPHA * offset_ms + (1.0 - SMOOTHING_ALPHA) * self.offset_ms;
        self.recalculate_confidence();

        tracing::debug!(
            "Clock sample: offset={:.1}ms rtt={:.1}ms smoothed={:.1}ms confidence={:.2}",
            offset_ms,
            rtt_ms,
            self.offset_ms,
            self.confidence
        );

        Some(sample)
    }

    fn recalculate_confidence(&mut self) {
        if self.samples.len() < MIN_SAMPLES_FOR_CONFIDENCE {
            return;
        }

        let window = self.samples.len().min(CONFIDENCE_WINDOW);
        let recent: Vec<f64> = self
            .samples
            .iter()
            .skip(self.samples.len() - window)
            .map(|s| s.rtt_ms)
            .collect();

        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let variance = recent.iter().map(|rtt| (rtt - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        let stddev = variance.sqrt();

        self.confidence = (1.0 - stddev / CONFIDENCE_STDDEV_SCALE_MS).clamp(0.0, 1.0);
    }

    /// Smoothed offset in milliseconds (remote minus local)
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Reliability of the offset in [0, 1]; zero until enough samples exist
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }

    /// Best guess of the reference peer's clock, given our own
    pub fn estimated_remote_time(&self, local_now_ms: u64) -> u64 {
        (local_now_ms as f64 + self.offset_ms).round().max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a symmetric exchange with the given RTT and true offset
    fn feed(estimator: &mut ClockOffsetEstimator, start: u64, rtt: u64, true_offset: i64) {
        let remote_receive = (start as i64 + (rtt / 2) as i64 + true_offset) as u64;
        estimator.on_probe_reply(start, remote_receive, remote_receive, start + rtt);
    }

    #[test]
    fn test_offset_and_rtt_formula() {
        let mut estimator = ClockOffsetEstimator::new();
        // Remote is 500ms ahead, 40ms each way, 10ms processing
        let sample = estimator.on_probe_reply(1_000, 1_540, 1_550, 1_090).unwrap();

        assert_eq!(sample.rtt_ms, 80.0);
        assert_eq!(sample.offset_ms, 500.0);
    }

    #[test]
    fn test_smoothing_tracks_offset() {
        let mut estimator = ClockOffsetEstimator::new();
        feed(&mut estimator, 0, 50, 1_000);
        // First sample only moves 30% of the way from zero
        assert!((estimator.offset_ms() - 300.0).abs() < 1e-9);

        for i in 1..40 {
            feed(&mut estimator, i * 2_000, 50, 1_000);
        }
        assert!((estimator.offset_ms() - 1_000.0).abs() < 1.0);
        assert_eq!(estimator.estimated_remote_time(10_000), 11_000);
    }

    #[test]
    fn test_rejects_unordered_timestamps() {
        let mut estimator = ClockOffsetEstimator::new();
        assert!(estimator.on_probe_reply(2_000, 100, 200, 1_000).is_none());
        assert!(estimator.on_probe_reply(1_000, 300, 200, 1_100).is_none());
        // Remote processing longer than the round trip is impossible
        assert!(estimator.on_probe_reply(1_000, 100, 500, 1_100).is_none());
        assert_eq!(estimator.sample_count(), 0);
    }

    #[test]
    fn test_confidence_needs_five_samples() {
        let mut estimator = ClockOffsetEstimator::new();
        for i in 0..4 {
            feed(&mut estimator, i * 2_000, 40, 0);
        }
        assert_eq!(estimator.confidence(), 0.0);

        feed(&mut estimator, 8_000, 40, 0);
        assert_eq!(estimator.confidence(), 1.0);
    }

    #[test]
    fn test_confidence_from_rtt_jitter() {
        let mut estimator = ClockOffsetEstimator::new();
        // RTTs alternate 40/60 -> stddev 10ms -> confidence 0.9
        for i in 0..10 {
            let rtt = if i % 2 == 0 { 40 } else { 60 };
            feed(&mut estimator, i * 2_000, rtt, 0);
        }
        assert!((estimator.confidence() - 0.9).abs() < 1e-9);

        // Wildly varying RTTs clamp to zero
        for i in 10..20 {
            let rtt = if i % 2 == 0 { 10 } else { 400 };
            feed(&mut estimator, i * 2_000, rtt, 0);
        }
        assert_eq!(estimator.confidence(), 0.0);
    }

    #[test]
    fn test_ring_buffer_capacity() {
        let mut estimator = ClockOffsetEstimator::new();
        for i in 0..50 {
            feed(&mut estimator, i * 2_000, 30, 0);
        }
        assert_eq!(estimator.sample_count(), MAX_SAMPLES);
        assert_eq!(estimator.samples().next().unwrap().timestamp_ms, 30 * 2_000 + 30);
    }

    #[test]
    fn test_reference_switch_resets() {
        let mut estimator = ClockOffsetEstimator::new();
        estimator.set_reference("host-a");
        feed(&mut estimator, 0, 30, 200);
        assert_eq!(estimator.sample_count(), 1);

        estimator.set_reference("host-a");
        assert_eq!(estimator.sample_count(), 1);

        estimator.set_reference("host-b");
        assert_eq!(estimator.sample_count(), 0);
        assert_eq!(estimator.offset_ms(), 0.0);
        assert_eq!(estimator.reference(), Some("host-b"));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
