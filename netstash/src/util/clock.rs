use chrono::{DateTime, Utc};

pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds since the Unix epoch, the granularity stored in the
    /// cache index.
    fn now_millis(&self) -> u64 {
        self.now().timestamp_millis().max(0) as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_fakes {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug, Clone, Default)]
    pub struct ControlledClock {
        millis: Arc<AtomicI64>,
    }

    impl ControlledClock {
        pub fn at_millis(millis: i64) -> Self {
            ControlledClock {
                millis: Arc::new(AtomicI64::new(millis)),
            }
        }

        pub fn advance_millis(&self, millis: i64) {
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ControlledClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
                .expect("timestamp out of range")
        }
    }
}
