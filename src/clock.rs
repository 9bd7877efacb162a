//! Time source abstraction — monotonic for backoffs/cooldowns, wall for logs.

use chrono::{DateTime, Utc};
use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock whose wall time can be frozen and advanced manually.
    /// Monotonic time still advances with the real clock since tests
    /// generally only need to control wall-time staleness checks.
    pub struct FakeClock {
        wall: Mutex<DateTime<Utc>>,
    }

    impl FakeClock {
        pub fn new(wall: DateTime<Utc>) -> Self {
            Self {
                wall: Mutex::new(wall),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut w = self.wall.lock().unwrap();
            *w = *w + delta;
        }
    }

    impl Clock for FakeClock {
        fn now_monotonic(&self) -> Instant {
            Instant::now()
        }

        fn now_wall(&self) -> DateTime<Utc> {
            *self.wall.lock().unwrap()
        }
    }
}
