//! Tape roller tachometer. The roller's quadrature output is routed to a
//! 32-bit timer in edge-capture mode; the capture ISR feeds timestamps in
//! here and a half-second watchdog timer reports when the edges stop. The
//! pulse stream is approximately 240 Hz with tape moving at 30 IPS.
//!
//! All math is on capture-timer counts, so this struct carries no hardware
//! dependencies; the ISR plumbing lives in `setup` and the task bodies.

/// Sliding average depth: 100 periods.
pub const TACH_AVG_QTY: usize = 100;

pub struct TapeTach {
    clock_hz: u32,

    previous_count: u32,
    average: [u32; TACH_AVG_QTY],
    average_sum: u64,
    average_idx: usize,

    alive: bool,
    freq_raw_hz: f32,
    freq_avg_hz: f32,
}

impl TapeTach {
    pub fn new(clock_hz: u32) -> Self {
        Self {
            clock_hz,
            previous_count: 0,
            average: [0; TACH_AVG_QTY],
            average_sum: 0,
            average_idx: 0,
            alive: false,
            freq_raw_hz: 0.,
            freq_avg_hz: 0.,
        }
    }

    /// Falling-edge capture: `count` is the free-running (up-counting)
    /// capture timer value at the edge.
    pub fn on_edge(&mut self, count: u32) {
        let period = count.wrapping_sub(self.previous_count);
        self.previous_count = count;

        // Shield from dividing by zero.
        if period == 0 {
            return;
        }

        // The new period replaces the oldest slot's contribution.
        self.average_sum -= self.average[self.average_idx] as u64;
        self.average_sum += period as u64;
        self.average[self.average_idx] = period;
        self.average_idx = (self.average_idx + 1) % TACH_AVG_QTY;

        self.alive = true;

        self.freq_raw_hz = self.clock_hz as f32 / period as f32;

        if self.average_sum > 0 {
            self.freq_avg_hz =
                self.clock_hz as f32 / (self.average_sum as f32 / TACH_AVG_QTY as f32);
        }
    }

    /// Absent-edge watchdog fired: no edges for half a second, the roller
    /// has stopped.
    pub fn on_timeout(&mut self) {
        self.alive = false;
        self.freq_raw_hz = 0.;
        self.freq_avg_hz = 0.;
    }

    /// Averaged roller frequency in Hz; zero when the tach is dead.
    pub fn read(&self) -> f32 {
        self.freq_avg_hz
    }

    pub fn read_raw(&self) -> f32 {
        self.freq_raw_hz
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn reset(&mut self) {
        self.average = [0; TACH_AVG_QTY];
        self.average_sum = 0;
        self.average_idx = 0;
        self.previous_count = 0;
        self.alive = false;
        self.freq_raw_hz = 0.;
        self.freq_avg_hz = 0.;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK: u32 = 170_000_000;

    #[test]
    fn steady_edges_converge_to_exact_frequency() {
        let mut tach = TapeTach::new(CLOCK);

        // 240 Hz pulse stream.
        let period = CLOCK / 240;
        let mut ts = 0u32;

        // One warm-up edge (bogus first period), then a full window.
        for _ in 0..TACH_AVG_QTY + 1 {
            ts = ts.wrapping_add(period);
            tach.on_edge(ts);
        }

        assert!(tach.is_alive());
        assert!((tach.read_raw() - 240.).abs() < 0.01);
        assert!((tach.read() - 240.).abs() < 0.01);
    }

    #[test]
    fn average_tracks_speed_changes_gradually() {
        let mut tach = TapeTach::new(CLOCK);

        let slow = CLOCK / 100;
        let fast = CLOCK / 200;
        let mut ts = 0u32;

        for _ in 0..TACH_AVG_QTY + 1 {
            ts = ts.wrapping_add(slow);
            tach.on_edge(ts);
        }
        assert!((tach.read() - 100.).abs() < 0.01);

        // Half a window at the new speed: average sits between the two.
        for _ in 0..TACH_AVG_QTY / 2 {
            ts = ts.wrapping_add(fast);
            tach.on_edge(ts);
        }

        let avg = tach.read();
        assert!(avg > 100. && avg < 200., "average {} out of range", avg);
        assert!((tach.read_raw() - 200.).abs() < 0.01);
    }

    #[test]
    fn timestamp_wraparound_is_transparent() {
        let mut tach = TapeTach::new(CLOCK);

        let period = CLOCK / 240;
        let mut ts = u32::MAX - period * 3;

        for _ in 0..TACH_AVG_QTY + 1 {
            ts = ts.wrapping_add(period);
            tach.on_edge(ts);
        }

        assert!((tach.read() - 240.).abs() < 0.01);
    }

    #[test]
    fn watchdog_zeroes_readings() {
        let mut tach = TapeTach::new(CLOCK);

        let period = CLOCK / 240;
        let mut ts = 0u32;
        for _ in 0..10 {
            ts = ts.wrapping_add(period);
            tach.on_edge(ts);
        }
        assert!(tach.is_alive());

        tach.on_timeout();

        assert!(!tach.is_alive());
        assert_eq!(tach.read(), 0.);
        assert_eq!(tach.read_raw(), 0.);

        // Edges resume: alive again on the first one.
        ts = ts.wrapping_add(period);
        tach.on_edge(ts);
        assert!(tach.is_alive());
    }

    #[test]
    fn reset_clears_history() {
        let mut tach = TapeTach::new(CLOCK);

        let mut ts = 0u32;
        for _ in 0..50 {
            ts = ts.wrapping_add(CLOCK / 60);
            tach.on_edge(ts);
        }

        tach.reset();
        assert_eq!(tach.read(), 0.);
        assert!(!tach.is_alive());
    }
}
