/// Rolling RPM history for the live plot
///
/// Samples are `(seconds since stream start, rpm)` pairs. Only the most
/// recent window (15 s by default) is kept.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub use crate::protocol::parse_current;

pub const DEFAULT_WINDOW_S: f64 = 15.0;
pub const DEFAULT_READ_TICK: Duration = Duration::from_millis(20);

/// How the time axis advances between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TelemetryClock {
    /// Each sample is one read tick after the previous one. Assumes no read
    /// tick is ever missed.
    #[default]
    FixedTick,
    /// Offsets are wall-clock time elapsed since the first sample.
    Measured,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time_s: f64,
    pub rpm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub span_s: f64,
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug)]
pub struct TelemetryWindow {
    samples: VecDeque<Sample>,
    window_s: f64,
    tick_s: f64,
    clock: TelemetryClock,
    started: bool,
    cursor_s: f64,
    origin: Option<Instant>,
}

impl Default for TelemetryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_S, DEFAULT_READ_TICK, TelemetryClock::FixedTick)
    }
}

impl TelemetryWindow {
    pub fn new(window_s: f64, read_tick: Duration, clock: TelemetryClock) -> Self {
        Self {
            samples: VecDeque::new(),
            window_s,
            tick_s: read_tick.as_secs_f64(),
            clock,
            started: false,
            cursor_s: 0.0,
            origin: None,
        }
    }

    /// Forget the current stream. The next sample starts a fresh one at t=0.
    pub fn restart(&mut self) {
        self.started = false;
        self.samples.clear();
        self.cursor_s = 0.0;
        self.origin = None;
    }

    pub fn append_sample(&mut self, rpm: f64) {
        self.append_sample_at(Instant::now(), rpm);
    }

    /// Append a sample observed at `now`. `now` only matters for the measured
    /// clock.
    pub fn append_sample_at(&mut self, now: Instant, rpm: f64) {
        if !self.started {
            self.started = true;
            self.samples.clear();
            self.cursor_s = 0.0;
            self.origin = Some(now);
        } else {
            self.cursor_s = match (self.clock, self.origin) {
                (TelemetryClock::Measured, Some(origin)) => {
                    let elapsed = now.saturating_duration_since(origin).as_secs_f64();
                    // A stalled or repeated timestamp still moves one read tick on.
                    if elapsed > self.cursor_s { elapsed } else { self.cursor_s + self.tick_s }
                }
                _ => self.cursor_s + self.tick_s,
            };
        }

        self.samples.push_back(Sample { time_s: self.cursor_s, rpm });
        log::trace!(target: "telemetry", "t={:.3}s rpm={}", self.cursor_s, rpm);

        while let Some(oldest) = self.samples.front() {
            if self.cursor_s - oldest.time_s > self.window_s {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn clock(&self) -> TelemetryClock {
        self.clock
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Plot-ready `[t, rpm]` points.
    pub fn points(&self) -> Vec<[f64; 2]> {
        self.samples.iter().map(|s| [s.time_s, s.rpm]).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn span(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.time_s - first.time_s,
            _ => 0.0,
        }
    }

    pub fn stats(&self) -> Option<WindowStats> {
        let latest = self.latest()?;
        let (min, max, sum) = self.samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), s| (min.min(s.rpm), max.max(s.rpm), sum + s.rpm),
        );
        Some(WindowStats {
            count: self.samples.len(),
            span_s: self.span(),
            latest: latest.rpm,
            min,
            max,
            mean: sum / self.samples.len() as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> TelemetryWindow {
        TelemetryWindow::default()
    }

    #[test]
    fn test_first_sample_starts_at_zero() {
        let mut w = fixed();
        w.append_sample(10.0);
        w.append_sample(12.0);
        let times: Vec<f64> = w.samples().map(|s| s.time_s).collect();
        assert_eq!(times[0], 0.0);
        assert!((times[1] - 0.02).abs() < 1e-9);
        assert!(w.is_started());
    }

    #[test]
    fn test_window_never_exceeds_fifteen_seconds() {
        let mut w = fixed();
        // 20 s worth of samples at the 20 ms tick.
        for i in 0..1000 {
            w.append_sample(i as f64);
            assert!(w.span() <= DEFAULT_WINDOW_S + 1e-9);
        }
        let first = w.samples().next().copied().unwrap();
        let last = w.latest().unwrap();
        assert!(last.time_s - first.time_s <= DEFAULT_WINDOW_S + 1e-9);
        assert!(w.len() < 1000);
        assert_eq!(last.rpm, 999.0);
    }

    #[test]
    fn test_times_strictly_increase() {
        let mut w = fixed();
        for _ in 0..50 {
            w.append_sample(1.0);
        }
        let times: Vec<f64> = w.samples().map(|s| s.time_s).collect();
        assert!(times.windows(2).all(|p| p[1] > p[0]));
    }

    #[test]
    fn test_restart_resets_origin() {
        let mut w = fixed();
        for _ in 0..10 {
            w.append_sample(50.0);
        }
        w.restart();
        assert!(w.is_empty());
        assert!(!w.is_started());
        w.append_sample(3.0);
        assert_eq!(w.points(), vec![[0.0, 3.0]]);
    }

    #[test]
    fn test_measured_clock_uses_elapsed_time() {
        let mut w = TelemetryWindow::new(15.0, DEFAULT_READ_TICK, TelemetryClock::Measured);
        let t0 = Instant::now();
        w.append_sample_at(t0, 1.0);
        w.append_sample_at(t0 + Duration::from_millis(500), 2.0);
        w.append_sample_at(t0 + Duration::from_secs(16), 3.0);
        let times: Vec<f64> = w.samples().map(|s| s.time_s).collect();
        // The first two samples fell out of the window.
        assert_eq!(times, vec![16.0]);
    }

    #[test]
    fn test_measured_clock_never_repeats_a_time() {
        let mut w = TelemetryWindow::new(15.0, DEFAULT_READ_TICK, TelemetryClock::Measured);
        let t0 = Instant::now();
        w.append_sample_at(t0, 1.0);
        w.append_sample_at(t0, 2.0);
        w.append_sample_at(t0 + Duration::from_secs(1), 3.0);
        // Earlier than the previous sample.
        w.append_sample_at(t0 + Duration::from_millis(500), 4.0);
        w.append_sample_at(t0 + Duration::from_millis(500), 5.0);

        let times: Vec<f64> = w.samples().map(|s| s.time_s).collect();
        assert_eq!(times.len(), 5);
        assert!(times.windows(2).all(|p| p[1] > p[0]), "{:?}", times);
        assert!((times[1] - 0.02).abs() < 1e-9);
        assert_eq!(times[2], 1.0);
    }

    #[test]
    fn test_stats() {
        let mut w = fixed();
        assert!(w.stats().is_none());
        for rpm in [10.0, 30.0, 20.0] {
            w.append_sample(rpm);
        }
        let stats = w.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.latest, 20.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert!((stats.mean - 20.0).abs() < 1e-9);
        assert!((stats.span_s - 0.04).abs() < 1e-9);
    }
}
