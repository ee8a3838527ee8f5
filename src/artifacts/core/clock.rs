//! Wall-clock source for garbage collection timestamps

use derive_new::new;

/// Source of the current time in seconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now(&self) -> u32;
}

/// Reads the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        // Saturates before 1970 and after 2106
        let seconds = chrono::Utc::now().timestamp().max(0);
        u32::try_from(seconds).unwrap_or(u32::MAX)
    }
}

/// Always reports the same instant
#[derive(Debug, Clone, Copy, new)]
pub struct FixedClock {
    now: u32,
}

impl Clock for FixedClock {
    fn now(&self) -> u32 {
        self.now
    }
}
