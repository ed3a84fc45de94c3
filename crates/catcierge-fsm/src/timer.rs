use std::time::Instant;

/// Monotonic stopwatch. A timer can be armed (duration set) without being
/// started; starting it begins the clock, resetting stops it. Inactive
/// timers read zero elapsed and never time out.
#[derive(Debug, Clone)]
pub struct Timer {
    duration: f64,
    start: Option<Instant>,
    bias: f64,
}

impl Timer {
    pub fn new() -> Self {
        Self { duration: 0.0, start: None, bias: 0.0 }
    }

    /// Arm with a duration in seconds. On a running timer this restarts
    /// the clock.
    pub fn set(&mut self, duration_s: f64) {
        self.duration = duration_s;
        if self.start.is_some() {
            self.start = Some(Instant::now());
            self.bias = 0.0;
        }
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.bias = 0.0;
    }

    pub fn reset(&mut self) {
        self.start = None;
        self.bias = 0.0;
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn elapsed(&self) -> f64 {
        self.start
            .map(|t| t.elapsed().as_secs_f64() + self.bias)
            .unwrap_or(0.0)
    }

    pub fn is_active(&self) -> bool {
        self.start.is_some()
    }

    pub fn timed_out(&self) -> bool {
        self.is_active() && self.elapsed() >= self.duration
    }

    /// Shift the clock forward, as if `secs` had passed. Test support.
    pub(crate) fn advance(&mut self, secs: f64) {
        self.bias += secs;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
