use std::time::Instant;

/// Wall-clock lap timer for logging how long each stage of a run takes.
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::info!("{}: {:.1} ms", msg, diff);
        diff
    }
}

/// Number of samples in `duration` seconds at `sample_rate` Hz, truncated toward zero.
pub fn sample_count(sample_rate: f64, duration: f64) -> usize {
    (sample_rate * duration).trunc() as usize
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_counts() {
        assert_eq!(sample_count(10., 1.), 10);
        assert_eq!(sample_count(10000., 10.), 100000);
        assert_eq!(sample_count(10., 10.), 100);
        assert_eq!(sample_count(3., 0.5), 1);
        assert_eq!(sample_count(1., 0.5), 0);
    }

    #[test]
    fn ticks_are_monotonic() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.tick_log("slept") >= 2.);
        assert!(timer.tick() >= 0.);
    }
}
