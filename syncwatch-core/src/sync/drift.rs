//! Drift classification and soft rate convergence

use super::protocol::SyncSnapshot;

/// Below this drift (seconds) playback counts as in sync
pub const LOCKED_THRESHOLD: f64 = 0.4;

/// Upper bound (exclusive) for correcting drift via playback rate
pub const SOFT_CONVERGENCE_LIMIT: f64 = 2.0;

/// Upper bound (exclusive) for drift surfaced to the user without forcing
pub const SHOW_UI_LIMIT: f64 = 12.0;

/// Maximum deviation of the playback rate from 1.0
pub const MAX_RATE_ADJUSTMENT: f64 = 0.03;

/// Drift below which an engaged convergence may be released
pub const RELEASE_THRESHOLD: f64 = 0.5;

/// Duration of a rate ramp
pub const RAMP_DURATION_MS: u64 = 500;

/// Minimum time a convergence rate is held before release is considered
pub const HOLD_DURATION_MS: u64 = 3_000;

/// What to do about a given drift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStrategy {
    Locked,
    SoftConvergence,
    ShowUi,
    ForceResync,
}

impl DriftStrategy {
    /// Classify a signed drift in seconds. Boundaries belong to the upper band.
    pub fn classify(drift: f64) -> Self {
        let magnitude = drift.abs();
        if magnitude < LOCKED_THRESHOLD {
            DriftStrategy::Locked
        } else if magnitude < SOFT_CONVERGENCE_LIMIT {
            DriftStrategy::SoftConvergence
        } else if magnitude < SHOW_UI_LIMIT {
            DriftStrategy::ShowUi
        } else {
            DriftStrategy::ForceResync
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStrategy::Locked => "locked",
            DriftStrategy::SoftConvergence => "soft-convergence",
            DriftStrategy::ShowUi => "show-ui",
            DriftStrategy::ForceResync => "force-resync",
        }
    }
}

/// Where the host's media should be now, by the host's clock
pub fn expected_position(snapshot: &SyncSnapshot, now_estimated_ms: u64) -> f64 {
    if snapshot.playing {
        let elapsed_ms = now_estimated_ms as f64 - snapshot.timestamp as f64;
        snapshot.position + elapsed_ms / 1000.0
    } else {
        snapshot.position
    }
}

/// Target playback rate for a drift. Ahead of the host (positive drift) slows down.
pub fn target_rate(drift: f64) -> f64 {
    let adjustment = (drift.abs() / 10.0).min(MAX_RATE_ADJUSTMENT);
    if drift > 0.0 {
        1.0 - adjustment
    } else {
        1.0 + adjustment
    }
}

/// Cubic ease-in-out over `progress` in [0, 1]
pub fn ease_in_out_cubic(progress: f64) -> f64 {
    let p = progress.clamp(0.0, 1.0);
    if p < 0.5 {
        4.0 * p * p * p
    } else {
        1.0 - (-2.0 * p + 2.0).powi(3) / 2.0
    }
}

/// An eased transition between two playback rates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRamp {
    pub from: f64,
    pub to: f64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

impl RateRamp {
    pub fn new(from: f64, to: f64, started_at_ms: u64) -> Self {
        Self {
            from,
            to,
            started_at_ms,
            duration_ms: RAMP_DURATION_MS,
        }
    }

    fn progress(&self, now_ms: u64) -> f64 {
        if self.duration_ms == 0 {
            return 1.0;
        }
        now_ms.saturating_sub(self.started_at_ms) as f64 / self.duration_ms as f64
    }

    pub fn rate_at(&self, now_ms: u64) -> f64 {
        let eased = ease_in_out_cubic(self.progress(now_ms));
        self.from + (self.to - self.from) * eased
    }

    pub fn is_complete(&self, now_ms: u64) -> bool {
        self.progress(now_ms) >= 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Engaged { hold_until_ms: u64 },
    Releasing,
}

/// Rate-based drift correction: ramp to a corrective rate, hold it, ramp back.
/// At most one ramp is in flight.
#[derive(Debug, Clone)]
pub struct SoftConvergence {
    phase: Phase,
    ramp: Option<RateRamp>,
}

impl Default for SoftConvergence {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftConvergence {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            ramp: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// A ramp still needs stepping
    pub fn is_ramping(&self) -> bool {
        self.ramp.is_some()
    }

    /// Start ramping toward the corrective rate. Returns false if already active.
    pub fn engage(&mut self, drift: f64, current_rate: f64, now_ms: u64) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.ramp = Some(RateRamp::new(clamp_rate(current_rate), target_rate(drift), now_ms));
        self.phase = Phase::Engaged {
            hold_until_ms: now_ms + HOLD_DURATION_MS,
        };
        true
    }

    /// After the hold, ramp back to 1.0 once drift is small enough
    pub fn maybe_release(&mut self, drift: f64, current_rate: f64, now_ms: u64) -> bool {
        let Phase::Engaged { hold_until_ms } = self.phase else {
            return false;
        };
        if now_ms < hold_until_ms || self.ramp.is_some() || drift.abs() >= RELEASE_THRESHOLD {
            return false;
        }
        self.ramp = Some(RateRamp::new(clamp_rate(current_rate), 1.0, now_ms));
        self.phase = Phase::Releasing;
        true
    }

    /// Rate to apply at `now_ms`, if a ramp is in flight
    pub fn step(&mut self, now_ms: u64) -> Option<f64> {
        let ramp = self.ramp?;
        let rate = ramp.rate_at(now_ms);
        if ramp.is_complete(now_ms) {
            self.ramp = None;
            if self.phase == Phase::Releasing {
                self.phase = Phase::Idle;
            }
        }
        Some(rate)
    }

    /// Abort any convergence. Returns true if something was active.
    pub fn cancel(&mut self) -> bool {
        let was_active = !self.is_idle();
        self.phase = Phase::Idle;
        self.ramp = None;
        was_active
    }
}

fn clamp_rate(rate: f64) -> f64 {
    rate.clamp(1.0 - MAX_RATE_ADJUSTMENT, 1.0 + MAX_RATE_ADJUSTMENT)
}
