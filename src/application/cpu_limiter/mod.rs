//! Cooperative CPU throttling for the built-in miner's worker threads.
//!
//! The limiter holds aggregate CPU usage of the registered workers near
//! `limit * cpu_count()` of one CPU. The mechanism is cooperative: workers
//! call [`CpuLimiter::suspend_me`] at safe points and a single watcher
//! thread decides, once per time slot, how much of the slot the workers may
//! spend running. The watcher never preempts anyone; a worker that stops
//! calling `suspend_me` simply stops being throttled.

pub mod thread_cpu_time;

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use thread_cpu_time::ThreadCpuClock;

/// One work/sleep control period. Windows gets a full second because its
/// per-thread CPU times advance in 15.6 ms steps.
#[cfg(not(windows))]
const TIME_SLOT: Duration = Duration::from_millis(100);
#[cfg(windows)]
const TIME_SLOT: Duration = Duration::from_millis(1000);

/// Below this wall-clock delta the CPU-time samples are too noisy to use.
const MIN_SAMPLE_DT: Duration = Duration::from_millis(20);

/// Smoothing factor of the per-worker usage EWMA.
const EWMA_ALPHA: f64 = 0.08;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("cpu limit must lie in [0, 1], got {0}")]
pub struct InvalidLimit(pub f64);

/// A registered worker, as the watcher sees it: an identity, a CPU clock,
/// the previous sample and the smoothed usage estimate.
struct LimitedThread {
    id: ThreadId,
    clock: ThreadCpuClock,
    cpu_time: Option<Duration>,
    usage: Option<f64>,
}

struct LimiterState {
    threads: Vec<LimitedThread>,
    suspend: bool,
    exit: bool,
    last_sample: Instant,
}

struct Shared {
    state: Mutex<LimiterState>,
    resume_cv: Condvar,
    exit_cv: Condvar,
}

/// Shapes the aggregate CPU usage of registered threads towards
/// `limit * cpu_count()` CPUs.
pub struct CpuLimiter {
    limit: f64,
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CpuLimiter {
    /// Start a limiter with the given per-CPU fraction. Both bounds are
    /// inclusive: 0 throttles fully, 1 not at all.
    pub fn new(limit: f64) -> Result<Self, InvalidLimit> {
        if !(0.0..=1.0).contains(&limit) {
            return Err(InvalidLimit(limit));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(LimiterState {
                threads: Vec::new(),
                suspend: false,
                exit: false,
                last_sample: Instant::now(),
            }),
            resume_cv: Condvar::new(),
            exit_cv: Condvar::new(),
        });

        let watcher_shared = Arc::clone(&shared);
        let watcher = thread::Builder::new()
            .name("cpu-limiter".to_string())
            .spawn(move || watch(&watcher_shared, limit))
            .expect("failed to spawn cpu limiter watcher thread");

        Ok(Self {
            limit,
            shared,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Host hardware concurrency; at least 1.
    pub fn cpu_count() -> usize {
        num_cpus::get().max(1)
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Register a worker thread for throttling. Idempotent per thread.
    pub fn add<T>(&self, handle: &JoinHandle<T>) {
        let id = handle.thread().id();
        let clock = ThreadCpuClock::for_thread(handle);
        let mut state = self.shared.state.lock().unwrap();
        if state.threads.iter().any(|t| t.id == id) {
            return;
        }
        state.threads.push(LimitedThread {
            id,
            clock,
            cpu_time: None,
            usage: None,
        });
    }

    pub fn remove<T>(&self, handle: &JoinHandle<T>) {
        let id = handle.thread().id();
        let mut state = self.shared.state.lock().unwrap();
        state.threads.retain(|t| t.id != id);
    }

    pub fn contains<T>(&self, handle: &JoinHandle<T>) -> bool {
        let id = handle.thread().id();
        let state = self.shared.state.lock().unwrap();
        state.threads.iter().any(|t| t.id == id)
    }

    /// Block the calling thread while the limiter is in its sleep phase.
    ///
    /// Safe to call from any thread, registered or not: when the suspend
    /// flag is clear this returns immediately. Returns when the watcher
    /// resumes the workers or the limiter shuts down.
    pub fn suspend_me(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.suspend && !state.exit {
            state = self.shared.resume_cv.wait(state).unwrap();
        }
    }

    /// Shut down the watcher and release every suspended worker. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.exit = true;
        }
        self.shared.exit_cv.notify_all();
        self.shared.resume_cv.notify_all();

        let watcher = self.watcher.lock().unwrap().take();
        if let Some(watcher) = watcher {
            if watcher.join().is_err() {
                warn!("cpu limiter watcher thread panicked");
            }
        }
    }
}

impl Drop for CpuLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The watcher control loop.
///
/// Each cycle resumes the workers for `TIME_SLOT * working_rate`, then
/// suspends them for the rest of the slot. The working rate follows the
/// feedback rule `rate' = rate / observed * target`, which converges on the
/// target without a model of worker throughput. While no usable sample
/// exists the rate falls back to the configured limit.
fn watch(shared: &Shared, limit: f64) {
    let total_limit = limit * CpuLimiter::cpu_count() as f64;
    let mut working_rate = limit;
    shared.state.lock().unwrap().last_sample = Instant::now();

    loop {
        if shared.state.lock().unwrap().exit {
            break;
        }

        working_rate = match total_cpu_usage(shared) {
            None => limit,
            Some(usage) => (working_rate / usage * total_limit).min(1.0),
        };
        trace!("cpu limiter working rate: {working_rate:.4}");

        let t_work = TIME_SLOT.mul_f64(working_rate);
        resume_all(shared);
        sleep_until_exit(shared, t_work);

        let t_sleep = TIME_SLOT.saturating_sub(t_work);
        shared.state.lock().unwrap().suspend = true;
        sleep_until_exit(shared, t_sleep);
    }

    // Wake everyone so suspended workers can observe termination.
    resume_all(shared);
}

/// Aggregate smoothed CPU usage of all registered workers since the last
/// sample, in CPUs. `None` when no usable sample exists yet: first cycle,
/// sample interval too short, or no worker with two good reads.
fn total_cpu_usage(shared: &Shared) -> Option<f64> {
    let mut state = shared.state.lock().unwrap();
    let now = Instant::now();
    let dt = now.duration_since(state.last_sample);
    if dt < MIN_SAMPLE_DT {
        return None;
    }

    let dt_secs = dt.as_secs_f64();
    let mut total: Option<f64> = None;
    for worker in &mut state.threads {
        let Some(previous) = worker.cpu_time else {
            // First sighting: establish a baseline, contribute nothing.
            match worker.clock.cpu_time() {
                Ok(t) => worker.cpu_time = Some(t),
                Err(err) => debug!("cpu time baseline read failed for {:?}: {err}", worker.id),
            }
            worker.usage = None;
            continue;
        };

        let current = match worker.clock.cpu_time() {
            Ok(t) => t,
            Err(err) => {
                debug!("cpu time read failed for {:?}: {err}", worker.id);
                worker.cpu_time = None;
                worker.usage = None;
                continue;
            }
        };

        let sample = current.saturating_sub(previous).as_secs_f64() / dt_secs;
        let usage = match worker.usage {
            None => sample,
            Some(previous_usage) => (1.0 - EWMA_ALPHA) * previous_usage + EWMA_ALPHA * sample,
        };
        worker.usage = Some(usage);
        worker.cpu_time = Some(current);
        *total.get_or_insert(0.0) += usage;
    }
    state.last_sample = now;

    total
}

fn resume_all(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    state.suspend = false;
    drop(state);
    shared.resume_cv.notify_all();
}

/// Sleep for `duration`, returning early when the exit flag is raised.
fn sleep_until_exit(shared: &Shared, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut state = shared.state.lock().unwrap();
    while !state.exit {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let (guard, timeout) = shared
            .exit_cv
            .wait_timeout(state, deadline - now)
            .unwrap();
        state = guard;
        if timeout.timed_out() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn limits_outside_zero_to_one_are_rejected() {
        assert_eq!(Err(InvalidLimit(-1.0)), CpuLimiter::new(-1.0).map(|_| ()));
        assert_eq!(Err(InvalidLimit(-0.01)), CpuLimiter::new(-0.01).map(|_| ()));
        assert_eq!(Err(InvalidLimit(1.01)), CpuLimiter::new(1.01).map(|_| ()));
        assert!(CpuLimiter::new(f64::NAN).is_err());
    }

    #[test]
    fn inclusive_bounds_are_accepted() {
        for limit in [0.0, 0.5, 1.0] {
            let limiter = CpuLimiter::new(limit).unwrap();
            assert_eq!(limit, limiter.limit());
            limiter.stop();
        }
    }

    #[test]
    fn cpu_count_is_at_least_one() {
        assert!(CpuLimiter::cpu_count() >= 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let limiter = CpuLimiter::new(0.5).unwrap();
        limiter.stop();
        limiter.stop();
    }

    #[test]
    fn suspend_me_is_a_no_op_for_unregistered_threads() {
        let limiter = CpuLimiter::new(1.0).unwrap();
        // With limit 1 the suspend flag is never raised for a full slot;
        // either way this must return promptly rather than deadlock.
        limiter.suspend_me();
        limiter.stop();
    }

    #[test]
    fn add_is_idempotent_and_remove_unregisters() {
        let limiter = CpuLimiter::new(0.5).unwrap();
        let parked = Arc::new(AtomicBool::new(false));
        let parked_flag = Arc::clone(&parked);
        let handle = thread::spawn(move || {
            while !parked_flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        });

        assert!(!limiter.contains(&handle));
        limiter.add(&handle);
        limiter.add(&handle);
        assert!(limiter.contains(&handle));
        assert_eq!(1, limiter.shared.state.lock().unwrap().threads.len());

        limiter.remove(&handle);
        assert!(!limiter.contains(&handle));

        parked.store(true, Ordering::Release);
        handle.join().unwrap();
        limiter.stop();
    }

    #[test]
    fn throttled_workers_make_progress_and_stop_releases_them() {
        let limiter = Arc::new(CpuLimiter::new(0.2).unwrap());
        let running = Arc::new(AtomicBool::new(true));
        let iterations = Arc::new(AtomicU64::new(0));

        let worker_limiter = Arc::clone(&limiter);
        let worker_running = Arc::clone(&running);
        let worker_iterations = Arc::clone(&iterations);
        let handle = thread::spawn(move || {
            while worker_running.load(Ordering::Acquire) {
                worker_iterations.fetch_add(1, Ordering::Relaxed);
                worker_limiter.suspend_me();
            }
        });
        limiter.add(&handle);

        // Let the watcher run through several work/sleep slots.
        thread::sleep(TIME_SLOT * 4);
        assert!(iterations.load(Ordering::Relaxed) > 0);

        running.store(false, Ordering::Release);
        limiter.stop();
        let joined = Instant::now();
        handle.join().unwrap();
        // A worker parked in suspend_me must be released promptly by stop.
        assert!(joined.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn zero_limit_still_allows_shutdown() {
        let limiter = Arc::new(CpuLimiter::new(0.0).unwrap());
        let running = Arc::new(AtomicBool::new(true));

        let worker_limiter = Arc::clone(&limiter);
        let worker_running = Arc::clone(&running);
        let handle = thread::spawn(move || {
            while worker_running.load(Ordering::Acquire) {
                worker_limiter.suspend_me();
            }
        });
        limiter.add(&handle);

        thread::sleep(TIME_SLOT * 2);
        running.store(false, Ordering::Release);
        limiter.stop();
        handle.join().unwrap();
    }
}
