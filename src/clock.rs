use core::fmt::Debug;

/// The client's monotonic time source.
///
/// Injected so tests can drive the state machine through hours of lease
/// lifetime without sleeping; the default reads the OS monotonic clock.
pub trait Clock: Debug + Send {
    /// Milliseconds since an arbitrary fixed origin; must never go backwards
    fn now_millis(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
