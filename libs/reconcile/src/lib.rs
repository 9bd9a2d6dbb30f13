//! Reconciliation loop primitives.
//!
//! This library provides helpers for long-running loops that converge local
//! state to a remotely published goal. Key concepts:
//!
//! - **Failure streaks**: sustained upstream failures must surface without
//!   flooding logs or telemetry.
//! - **Launch throttling**: a supervised child that keeps dying is a crash
//!   loop, not a transient failure.
//! - **Cadence**: a loop polls quickly until the goal converges, then backs
//!   off to a steady-state period.
//!
//! # Invariants
//!
//! - All helpers are deterministic given the same inputs and clock
//! - A failure streak reports at most `max_immediate` individual events plus
//!   one aggregated event per report window
//! - Cadence transitions are one-way: once steady, never back to initial

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

// =============================================================================
// Failure streaks
// =============================================================================

/// How a single failure in a streak should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// Report this failure individually.
    Immediate,

    /// Report one aggregated "still failing" event covering the streak.
    Periodic,

    /// Suppress; the report window has not elapsed.
    Suppress,
}

/// Tracks consecutive failures and bounds how often they are reported.
///
/// The first `max_immediate` consecutive failures each report individually.
/// Later failures report only when the periodic window elapses since the
/// last aggregated report. The window survives recovery, so flapping cannot
/// produce more than one aggregated event per window.
#[derive(Debug, Clone)]
pub struct ErrorStreak {
    max_immediate: u32,
    report_interval: chrono::Duration,
    count: u32,
    started_at: Option<DateTime<Utc>>,
    next_periodic_report: Option<DateTime<Utc>>,
}

impl ErrorStreak {
    pub fn new(max_immediate: u32, report_interval: Duration) -> Self {
        Self {
            max_immediate,
            report_interval: chrono::Duration::from_std(report_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(6)),
            count: 0,
            started_at: None,
            next_periodic_report: None,
        }
    }

    /// Record a failure, returning how it should be reported.
    pub fn record_failure(&mut self) -> ReportDisposition {
        self.record_failure_at(Utc::now())
    }

    /// Record a failure at an explicit time (for deterministic tests).
    pub fn record_failure_at(&mut self, now: DateTime<Utc>) -> ReportDisposition {
        self.count += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if self.count <= self.max_immediate {
            return ReportDisposition::Immediate;
        }

        let due = self.next_periodic_report.map(|at| now >= at).unwrap_or(true);
        if due {
            self.next_periodic_report = Some(now + self.report_interval);
            ReportDisposition::Periodic
        } else {
            ReportDisposition::Suppress
        }
    }

    /// Record a success. Returns `true` when this ends a failure streak,
    /// in which case the caller should emit exactly one recovery event.
    pub fn record_success(&mut self) -> bool {
        let was_failing = self.count > 0;
        self.count = 0;
        self.started_at = None;
        was_failing
    }

    /// Number of consecutive failures so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// When the current streak began, if one is in progress.
    pub fn failing_since(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Force the periodic window to be due (used by tests and diagnostics).
    pub fn expire_report_window(&mut self) {
        self.next_periodic_report = None;
    }
}

// =============================================================================
// Launch throttling
// =============================================================================

/// Windowed launch counter for crash-loop detection.
///
/// Counts launches of the same target inside a rolling window; switching to
/// a different target resets the count. The caller decides what to do when
/// the limit is exceeded (typically: mark the target fatally failed).
#[derive(Debug, Clone)]
pub struct LaunchTracker {
    max_launches: u32,
    window: Duration,
    target: Option<String>,
    launches: Vec<Instant>,
}

impl LaunchTracker {
    pub fn new(max_launches: u32, window: Duration) -> Self {
        Self {
            max_launches,
            window,
            target: None,
            launches: Vec::new(),
        }
    }

    /// Record a launch of `target`.
    ///
    /// Returns `true` when this launch exceeds the limit for the window,
    /// i.e. the target is crash-looping.
    pub fn record_launch(&mut self, target: &str) -> bool {
        let now = Instant::now();

        if self.target.as_deref() != Some(target) {
            self.target = Some(target.to_string());
            self.launches.clear();
        }

        self.launches.push(now);
        self.launches
            .retain(|at| now.duration_since(*at) <= self.window);

        self.launches.len() as u32 > self.max_launches
    }

    /// Number of launches of the current target still inside the window.
    pub fn launches_in_window(&self) -> u32 {
        self.launches.len() as u32
    }

    /// Forget all recorded launches.
    pub fn reset(&mut self) {
        self.target = None;
        self.launches.clear();
    }
}

// =============================================================================
// Poll cadence
// =============================================================================

/// Convergence status for the current goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Everything reached a terminal status.
    Converged,

    /// Work is still in flight.
    Converging,

    /// Insufficient data.
    Unknown,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Switches between an initial (short) and steady-state (long) poll period.
///
/// The loop polls on the initial period until the goal converges, or until a
/// new goal arrives before the previous one converged. Either way it then
/// moves to the steady period and stays there.
#[derive(Debug, Clone)]
pub struct PollCadence {
    initial: Duration,
    steady: Duration,
    on_initial: bool,
}

impl PollCadence {
    pub fn new(initial: Duration, steady: Duration) -> Self {
        Self {
            initial,
            steady,
            on_initial: true,
        }
    }

    /// The period the loop should sleep for right now.
    pub fn current(&self) -> Duration {
        if self.on_initial {
            self.initial
        } else {
            self.steady
        }
    }

    pub fn is_initial(&self) -> bool {
        self.on_initial
    }

    /// Feed one iteration's observations into the cadence.
    pub fn observe(&mut self, status: ConvergenceStatus, new_goal: bool) {
        if !self.on_initial {
            return;
        }
        if status.is_converged() || new_goal {
            self.on_initial = false;
        }
    }
}

/// Default cap on individually reported consecutive failures.
pub const DEFAULT_MAX_IMMEDIATE_REPORTS: u32 = 3;

/// Default aggregated-report window for sustained failures.
pub const DEFAULT_FAILURE_REPORT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default launch limit before a target counts as crash-looping.
pub const DEFAULT_MAX_LAUNCHES: u32 = 3;

/// Default rolling window for launch counting.
pub const DEFAULT_LAUNCH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_streak_reports_first_failures_immediately() {
        let mut streak = ErrorStreak::new(3, Duration::from_secs(3600));

        let mut immediate = 0;
        let mut periodic = 0;
        for i in 0..10 {
            match streak.record_failure_at(at(i)) {
                ReportDisposition::Immediate => immediate += 1,
                ReportDisposition::Periodic => periodic += 1,
                ReportDisposition::Suppress => {}
            }
        }

        assert_eq!(immediate, 3);
        assert_eq!(periodic, 1, "one aggregated report per window");
        assert_eq!(streak.count(), 10);
    }

    #[test]
    fn test_streak_periodic_reports_once_window_elapses() {
        let mut streak = ErrorStreak::new(3, Duration::from_secs(60));

        for i in 0..4 {
            streak.record_failure_at(at(i));
        }

        // Window has not elapsed.
        assert_eq!(streak.record_failure_at(at(30)), ReportDisposition::Suppress);
        // Window elapsed.
        assert_eq!(streak.record_failure_at(at(120)), ReportDisposition::Periodic);
        assert_eq!(streak.record_failure_at(at(121)), ReportDisposition::Suppress);
    }

    #[test]
    fn test_streak_recovery_fires_once() {
        let mut streak = ErrorStreak::new(3, Duration::from_secs(3600));

        assert!(!streak.record_success(), "no streak, no recovery event");

        streak.record_failure_at(at(0));
        streak.record_failure_at(at(1));

        assert!(streak.record_success());
        assert!(!streak.record_success(), "recovery reported exactly once");
        assert_eq!(streak.count(), 0);
    }

    #[test]
    fn test_streak_window_survives_recovery() {
        let mut streak = ErrorStreak::new(3, Duration::from_secs(3600));

        for i in 0..4 {
            streak.record_failure_at(at(i));
        }
        assert!(streak.record_success());

        // A new streak within the same window: individual reports come back,
        // but no second aggregated report until the window elapses.
        for i in 10..13 {
            assert_eq!(
                streak.record_failure_at(at(i)),
                ReportDisposition::Immediate
            );
        }
        assert_eq!(streak.record_failure_at(at(13)), ReportDisposition::Suppress);
    }

    #[test]
    fn test_launch_tracker_detects_crash_loop() {
        let mut tracker = LaunchTracker::new(3, Duration::from_secs(300));

        assert!(!tracker.record_launch("2.2.53"));
        assert!(!tracker.record_launch("2.2.53"));
        assert!(!tracker.record_launch("2.2.53"));
        assert!(tracker.record_launch("2.2.53"), "4th launch exceeds the limit");
    }

    #[test]
    fn test_launch_tracker_resets_on_different_target() {
        let mut tracker = LaunchTracker::new(3, Duration::from_secs(300));

        for _ in 0..3 {
            tracker.record_launch("2.2.53");
        }
        assert!(!tracker.record_launch("9.9.9.10"), "new target starts fresh");
        assert_eq!(tracker.launches_in_window(), 1);
    }

    #[test]
    fn test_cadence_switches_on_convergence() {
        let mut cadence =
            PollCadence::new(Duration::from_secs(6), Duration::from_secs(30));

        assert!(cadence.is_initial());
        assert_eq!(cadence.current(), Duration::from_secs(6));

        cadence.observe(ConvergenceStatus::Converging, false);
        assert!(cadence.is_initial(), "still transitioning");

        cadence.observe(ConvergenceStatus::Converged, false);
        assert!(!cadence.is_initial());
        assert_eq!(cadence.current(), Duration::from_secs(30));
    }

    #[test]
    fn test_cadence_switches_on_new_goal_before_convergence() {
        let mut cadence =
            PollCadence::new(Duration::from_secs(6), Duration::from_secs(30));

        cadence.observe(ConvergenceStatus::Converging, true);
        assert!(!cadence.is_initial());

        // One-way: converging again later does not go back.
        cadence.observe(ConvergenceStatus::Converging, false);
        assert!(!cadence.is_initial());
    }
}
