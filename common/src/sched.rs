use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Clock and yield point for the long-running loops.
///
/// Both the stream loop and the OTA loop call `yield_now` once per iteration
/// and take every timeout decision from `now_ms`, which must be monotonic.
pub trait Scheduler {
    fn now_ms(&self) -> u64;
    fn yield_now(&self);
    fn sleep_ms(&self, ms: u64);
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn yield_now(&self) {
        (**self).yield_now()
    }

    fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms)
    }
}

/// Scheduler backed by `std::time::Instant` and `std::thread::sleep`.
///
/// On ESP-IDF a 1 ms sleep maps to a one-tick FreeRTOS delay, which lets the
/// idle task and the network stack run.
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    start: Instant,
    yield_ms: u64,
}

impl ThreadScheduler {
    pub fn new(yield_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            yield_ms: yield_ms.max(1),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Scheduler for ThreadScheduler {
    fn now_ms(&self) -> u64 {
        self.start
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn yield_now(&self) {
        thread::sleep(Duration::from_millis(self.yield_ms));
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Cooperative stop request observed by the stream and OTA loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_triggered());

        signal.trigger();
        assert!(observer.is_triggered());

        observer.reset();
        assert!(!signal.is_triggered());
    }

    #[test]
    fn thread_scheduler_clock_is_monotonic() {
        let scheduler = ThreadScheduler::default();
        let first = scheduler.now_ms();
        scheduler.sleep_ms(2);
        assert!(scheduler.now_ms() >= first + 2);
    }
}
