use log::debug;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand::SeedableRng;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Callback invoked when the detector fires. Held weakly by callers via
/// whatever the closure captures; a fire after the owner is gone must be
/// a no-op inside the closure.
pub type FailureDetectedFn = Box<dyn Fn() + Send + Sync>;

struct DetectorState {
    enabled: bool,
    shutdown: bool,
    deadline: Instant,
}

/// One-shot periodic leader-failure timer.
///
/// The period is `heartbeat_interval * max_missed_heartbeats`, jittered
/// uniformly into `[period, 1.5 * period]` so concurrent replicas do not
/// split votes. Snoozing pushes the deadline out; a disabled detector
/// never fires.
pub struct FailureDetector {
    period: Duration,
    state: Mutex<DetectorState>,
    wakeup: Condvar,
    rng: Mutex<ChaCha20Rng>,
    on_failure: FailureDetectedFn,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FailureDetector {
    pub fn new(period: Duration, rng_seed: u64, on_failure: FailureDetectedFn) -> Arc<Self> {
        let detector = Arc::new(Self {
            period,
            state: Mutex::new(DetectorState {
                enabled: false,
                shutdown: false,
                deadline: Instant::now() + period,
            }),
            wakeup: Condvar::new(),
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(rng_seed)),
            on_failure,
            worker: Mutex::new(None),
        });
        let runner = Arc::clone(&detector);
        let handle = thread::Builder::new()
            .name("raft-failure-detector".into())
            .spawn(move || runner.run())
            .expect("spawn failure detector");
        *detector.worker.lock().unwrap() = Some(handle);
        detector
    }

    fn jittered_period(&self, base: Duration) -> Duration {
        let extra = base.as_millis() as u64 / 2;
        if extra == 0 {
            return base;
        }
        let jitter = self.rng.lock().unwrap().gen_range(0..=extra);
        base + Duration::from_millis(jitter)
    }

    /// Starts tracking the leader for failures. No effect if already
    /// enabled.
    pub fn enable(&self, initial_period: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            return;
        }
        state.enabled = true;
        let base = initial_period.unwrap_or(self.period);
        state.deadline = Instant::now() + self.jittered_period(base);
        debug!("event=raft_failure_detector_enabled period_ms={}", base.as_millis());
        self.wakeup.notify_all();
    }

    /// Stops tracking; typically on becoming leader or non-voter.
    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            state.enabled = false;
            debug!("event=raft_failure_detector_disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Pushes the deadline forward after leader contact, a cast vote, or
    /// a completed election. `delta` overrides the default period (used
    /// for election backoff).
    pub fn snooze(&self, delta: Option<Duration>) {
        let base = delta.unwrap_or(self.period);
        let deadline = Instant::now() + self.jittered_period(base);
        let mut state = self.state.lock().unwrap();
        state.deadline = deadline;
        self.wakeup.notify_all();
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            self.wakeup.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }
            if !state.enabled {
                state = self.wakeup.wait(state).unwrap();
                continue;
            }
            let now = Instant::now();
            if now < state.deadline {
                let timeout = state.deadline - now;
                let (guard, _) = self.wakeup.wait_timeout(state, timeout).unwrap();
                state = guard;
                continue;
            }
            // Fire and rearm. The callback runs without the state lock.
            state.deadline = now + self.jittered_period(self.period);
            drop(state);
            debug!("event=raft_failure_detector_fired");
            (self.on_failure)();
            state = self.state.lock().unwrap();
        }
    }
}

impl Drop for FailureDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_period_when_enabled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let detector = FailureDetector::new(
            Duration::from_millis(20),
            7,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        detector.enable(None);
        thread::sleep(Duration::from_millis(120));
        assert!(fired.load(Ordering::SeqCst) >= 1);
        detector.shutdown();
    }

    #[test]
    fn disabled_detector_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let detector = FailureDetector::new(
            Duration::from_millis(10),
            7,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        detector.shutdown();
    }

    #[test]
    fn snooze_postpones_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let detector = FailureDetector::new(
            Duration::from_millis(50),
            7,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        detector.enable(None);
        for _ in 0..6 {
            detector.snooze(Some(Duration::from_millis(50)));
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        detector.shutdown();
    }
}
