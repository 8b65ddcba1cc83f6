//! Cycle clock shared between the processor and the engine

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::port::Frames;

const NOT_STARTED: u64 = u64::MAX;

/// Timing published by the processor at the top of every cycle and read by
/// the control side without locking.
pub(crate) struct CycleClock {
    epoch: Instant,
    /// Nanoseconds from `epoch` to the start of the current cycle
    cycle_start: AtomicU64,
    /// Frames processed before the current cycle
    frame_time: AtomicU64,
    /// Transport position last reported by the timebase owner
    transport: AtomicU64,
}

impl CycleClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            cycle_start: AtomicU64::new(NOT_STARTED),
            frame_time: AtomicU64::new(0),
            transport: AtomicU64::new(0),
        }
    }

    pub fn begin_cycle(&self, started: Instant, frame_time: u64) {
        let nanos = started.saturating_duration_since(self.epoch).as_nanos();
        self.cycle_start
            .store(u64::try_from(nanos).unwrap_or(NOT_STARTED - 1), Ordering::Release);
        self.frame_time.store(frame_time, Ordering::Release);
    }

    /// Estimated frames elapsed since the current cycle started, 0 before the first.
    pub fn frames_since_cycle_start(&self, sample_rate: u32) -> Frames {
        let start = self.cycle_start.load(Ordering::Acquire);
        if start == NOT_STARTED {
            return 0;
        }
        let now = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let elapsed = now.saturating_sub(start) as f64 / 1e9;
        // float to int casts saturate
        (elapsed * f64::from(sample_rate)) as Frames
    }

    pub fn frame_time(&self) -> u64 {
        self.frame_time.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> u64 {
        self.transport.load(Ordering::Acquire)
    }

    pub fn set_transport(&self, frame: u64) {
        self.transport.store(frame, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_nothing_elapsed_before_first_cycle() {
        let clock = CycleClock::new();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.frames_since_cycle_start(48_000), 0);
    }

    #[test]
    fn test_elapsed_frames_follow_wall_clock() {
        let clock = CycleClock::new();
        let started = Instant::now();
        clock.begin_cycle(started, 512);
        std::thread::sleep(Duration::from_millis(10));

        // at least 10ms at 48kHz
        assert!(clock.frames_since_cycle_start(48_000) >= 480);
        assert_eq!(clock.frame_time(), 512);
    }
}
