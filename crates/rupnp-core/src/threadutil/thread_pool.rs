//! Fixed-ceiling worker pool with three priority queues.
//!
//! Workers prefer the persistent slot, then the highest non-empty queue.
//! Whenever a worker wakes it promotes starved queue heads one level
//! (med -> high, low -> med); escalation is head-only and never duplicates
//! a job. The pool grows on enqueue while the job/worker ratio is exceeded
//! and shrinks when an idle worker times out above `min_threads`.
//!
//! Jobs are plain `FnOnce` closures; dropping an unexecuted job releases
//! whatever it captured, which is the only cleanup path the pool promises.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::config::SchedPolicy;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Low,
    Med,
    High,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Enqueueing would cross `max_jobs_total`; the job has been dropped.
    #[error("job queue full")]
    QueueFull,
    /// No free worker for a persistent job and none can be created.
    #[error("no worker available")]
    MaxThreads,
    /// The pool is shut down.
    #[error("pool is shut down")]
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ThreadPoolAttr {
    pub min_threads: usize,
    pub max_threads: usize,
    /// 0 keeps the platform default.
    pub stack_size: usize,
    /// How long an idle worker waits for a job before it may exit.
    pub max_idle_time: Duration,
    /// Queued-jobs-per-worker ratio that triggers growth.
    pub jobs_per_thread: usize,
    pub max_jobs_total: usize,
    /// Age at which a queued job is promoted one priority level.
    pub starvation_time: Duration,
    /// Recorded only; thread scheduling classes are not portable.
    pub sched_policy: SchedPolicy,
}

impl Default for ThreadPoolAttr {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 10,
            stack_size: 0,
            max_idle_time: Duration::from_secs(10),
            jobs_per_thread: 10,
            max_jobs_total: 500,
            starvation_time: Duration::from_millis(500),
            sched_policy: SchedPolicy::Other,
        }
    }
}

/// Counters reported by [`ThreadPool::stats`]. Wait times accumulate at the
/// moment a job leaves a queue (by execution or by promotion out of it).
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPoolStats {
    pub total_jobs_hq: usize,
    pub total_jobs_mq: usize,
    pub total_jobs_lq: usize,
    pub total_wait_hq: Duration,
    pub total_wait_mq: Duration,
    pub total_wait_lq: Duration,
    pub current_jobs_hq: usize,
    pub current_jobs_mq: usize,
    pub current_jobs_lq: usize,
    pub worker_threads: usize,
    pub idle_threads: usize,
    pub persistent_threads: usize,
    pub total_threads: usize,
    pub max_threads_seen: usize,
}

impl ThreadPoolStats {
    pub fn avg_wait_hq(&self) -> Duration {
        Self::avg(self.total_wait_hq, self.total_jobs_hq)
    }
    pub fn avg_wait_mq(&self) -> Duration {
        Self::avg(self.total_wait_mq, self.total_jobs_mq)
    }
    pub fn avg_wait_lq(&self) -> Duration {
        Self::avg(self.total_wait_lq, self.total_jobs_lq)
    }
    fn avg(total: Duration, n: usize) -> Duration {
        if n == 0 {
            Duration::ZERO
        } else {
            total / n as u32
        }
    }
}

struct PoolJob {
    priority: JobPriority,
    enqueued: Instant,
    task: Task,
}

struct PoolState {
    high: VecDeque<PoolJob>,
    med: VecDeque<PoolJob>,
    low: VecDeque<PoolJob>,
    persistent_slot: Option<PoolJob>,
    attr: ThreadPoolAttr,
    shutdown: bool,
    total_threads: usize,
    idle_threads: usize,
    persistent_threads: usize,
    pending_worker_start: bool,
    next_worker_id: usize,
    stats: ThreadPoolStats,
}

impl PoolState {
    fn queued_total(&self) -> usize {
        self.high.len() + self.med.len() + self.low.len()
    }

    fn account_wait(&mut self, priority: JobPriority, waited: Duration) {
        match priority {
            JobPriority::High => {
                self.stats.total_jobs_hq += 1;
                self.stats.total_wait_hq += waited;
            }
            JobPriority::Med => {
                self.stats.total_jobs_mq += 1;
                self.stats.total_wait_mq += waited;
            }
            JobPriority::Low => {
                self.stats.total_jobs_lq += 1;
                self.stats.total_wait_lq += waited;
            }
        }
    }
}

struct Shared {
    state: Mutex<PoolState>,
    /// Job arrival / shutdown signal for idle workers.
    condition: Condvar,
    /// Worker start/exit and persistent-slot handover signal.
    start_and_shutdown: Condvar,
}

/// Handle to the pool. Clones share the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Initialize the pool and spawn `min_threads` workers.
    pub fn start(attr: ThreadPoolAttr) -> Result<Self, PoolError> {
        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    high: VecDeque::new(),
                    med: VecDeque::new(),
                    low: VecDeque::new(),
                    persistent_slot: None,
                    attr: attr.clone(),
                    shutdown: false,
                    total_threads: 0,
                    idle_threads: 0,
                    persistent_threads: 0,
                    pending_worker_start: false,
                    next_worker_id: 0,
                    stats: ThreadPoolStats::default(),
                }),
                condition: Condvar::new(),
                start_and_shutdown: Condvar::new(),
            }),
        };
        let mut failed = None;
        {
            let mut state = pool.shared.state.lock();
            for _ in 0..attr.min_threads {
                if let Err(e) = create_worker(&pool.shared, &mut state) {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            // Partial start: take down whatever came up.
            pool.shutdown();
            return Err(e);
        }
        Ok(pool)
    }

    /// Queue a job to run as soon as possible. The job is dropped (releasing
    /// its captures) if the queue ceiling is hit.
    pub fn add_job(
        &self,
        priority: JobPriority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), PoolError> {
        self.add_job_boxed(priority, Box::new(task))
    }

    pub(crate) fn add_job_boxed(&self, priority: JobPriority, task: Task) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        if state.queued_total() >= state.attr.max_jobs_total {
            log::warn!(
                "pool: rejecting job, {} already queued",
                state.queued_total()
            );
            return Err(PoolError::QueueFull);
        }
        let job = PoolJob {
            priority,
            enqueued: Instant::now(),
            task,
        };
        match priority {
            JobPriority::High => state.high.push_back(job),
            JobPriority::Med => state.med.push_back(job),
            JobPriority::Low => state.low.push_back(job),
        }
        grow_if_needed(&self.shared, &mut state);
        self.shared.condition.notify_one();
        Ok(())
    }

    /// Hand a job to a dedicated worker and block until it has been picked
    /// up. The worker is counted in the totals but excluded from the
    /// growth-ratio denominator for as long as it runs the job.
    pub fn add_persistent(
        &self,
        priority: JobPriority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), PoolError> {
        self.add_persistent_boxed(priority, Box::new(task))
    }

    pub(crate) fn add_persistent_boxed(
        &self,
        priority: JobPriority,
        task: Task,
    ) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        if state.total_threads < state.attr.max_threads {
            // Best effort; an existing idle worker can still take the slot.
            let _ = create_worker(&self.shared, &mut state);
        } else if state.total_threads <= state.persistent_threads + 1 {
            // Consuming the last regular worker would starve the queues.
            return Err(PoolError::MaxThreads);
        }
        state.persistent_slot = Some(PoolJob {
            priority,
            enqueued: Instant::now(),
            task,
        });
        self.shared.condition.notify_one();
        while state.persistent_slot.is_some() && !state.shutdown {
            self.shared.start_and_shutdown.wait(&mut state);
        }
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        Ok(())
    }

    pub fn attr(&self) -> ThreadPoolAttr {
        self.shared.state.lock().attr.clone()
    }

    /// Replace the attributes. Takes effect on future decisions; workers are
    /// spawned immediately if the new `min_threads` demands it.
    pub fn set_attr(&self, attr: ThreadPoolAttr) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        state.attr = attr;
        while state.total_threads < state.attr.min_threads {
            create_worker(&self.shared, &mut state)?;
        }
        // Let idle workers re-check the (possibly lowered) ceiling.
        self.shared.condition.notify_all();
        Ok(())
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats;
        stats.current_jobs_hq = state.high.len();
        stats.current_jobs_mq = state.med.len();
        stats.current_jobs_lq = state.low.len();
        stats.total_threads = state.total_threads;
        stats.idle_threads = state.idle_threads;
        stats.persistent_threads = state.persistent_threads;
        stats.worker_threads = state.total_threads - state.persistent_threads;
        stats
    }

    /// Drain the queues (dropping the unexecuted jobs), then wait for every
    /// worker, including persistent ones, to finish and exit.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.high.clear();
        state.med.clear();
        state.low.clear();
        state.persistent_slot = None;
        state.shutdown = true;
        self.shared.condition.notify_all();
        self.shared.start_and_shutdown.notify_all();
        while state.total_threads > 0 {
            self.shared.start_and_shutdown.wait(&mut state);
        }
    }
}

/// Promote starved queue heads, one level per pass: the wait clock restarts
/// in the new queue, so a job never leapfrogs from low straight to high in
/// a single wakeup. Caller holds the state lock.
fn bump_starved(state: &mut PoolState) {
    let now = Instant::now();
    loop {
        if let Some(job) = state.med.front() {
            let waited = now.duration_since(job.enqueued);
            if waited >= state.attr.starvation_time {
                state.account_wait(JobPriority::Med, waited);
                let mut job = state.med.pop_front().expect("front checked");
                job.enqueued = now;
                state.high.push_back(job);
                continue;
            }
        }
        if let Some(job) = state.low.front() {
            let waited = now.duration_since(job.enqueued);
            if waited >= state.attr.starvation_time {
                state.account_wait(JobPriority::Low, waited);
                let mut job = state.low.pop_front().expect("front checked");
                job.enqueued = now;
                state.med.push_back(job);
                continue;
            }
        }
        break;
    }
}

/// Spawn workers while the queued-jobs/worker ratio demands it. Persistent
/// workers do not count into the denominator. Caller holds the state lock.
fn grow_if_needed(shared: &Arc<Shared>, state: &mut MutexGuard<'_, PoolState>) {
    loop {
        let jobs = state.queued_total();
        let threads = state.total_threads - state.persistent_threads;
        if threads != 0 && jobs / threads < state.attr.jobs_per_thread {
            return;
        }
        if create_worker(shared, state).is_err() {
            return;
        }
    }
}

/// Spawn one worker unless the ceiling is reached; waits for the new thread
/// to register itself so the counters are exact. Caller holds the state lock.
fn create_worker(
    shared: &Arc<Shared>,
    state: &mut MutexGuard<'_, PoolState>,
) -> Result<(), PoolError> {
    while state.pending_worker_start {
        shared.start_and_shutdown.wait(state);
    }
    if state.total_threads + 1 > state.attr.max_threads {
        return Err(PoolError::MaxThreads);
    }
    let id = state.next_worker_id;
    state.next_worker_id += 1;
    let mut builder = thread::Builder::new().name(format!("pool-worker-{id}"));
    if state.attr.stack_size > 0 {
        builder = builder.stack_size(state.attr.stack_size);
    }
    let shared2 = Arc::clone(shared);
    builder
        .spawn(move || worker_loop(shared2))
        .map_err(|_| PoolError::MaxThreads)?;
    state.pending_worker_start = true;
    while state.pending_worker_start {
        shared.start_and_shutdown.wait(state);
    }
    if state.stats.max_threads_seen < state.total_threads {
        state.stats.max_threads_seen = state.total_threads;
    }
    Ok(())
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    state.total_threads += 1;
    state.pending_worker_start = false;
    shared.start_and_shutdown.notify_all();

    let mut timed_out = false;
    'outer: loop {
        state.idle_threads += 1;
        while state.queued_total() == 0
            && state.persistent_slot.is_none()
            && !state.shutdown
        {
            // Exit if the idle wait timed out above min_threads, or if a
            // set_attr lowered the ceiling under us.
            if (timed_out && state.total_threads > state.attr.min_threads)
                || state.total_threads > state.attr.max_threads
            {
                state.idle_threads -= 1;
                break 'outer;
            }
            let max_idle = state.attr.max_idle_time;
            timed_out = shared.condition.wait_for(&mut state, max_idle).timed_out();
        }
        state.idle_threads -= 1;
        bump_starved(&mut state);
        if state.shutdown {
            break 'outer;
        }

        let (job, is_persistent) = if let Some(job) = state.persistent_slot.take() {
            state.persistent_threads += 1;
            shared.start_and_shutdown.notify_all();
            (job, true)
        } else if let Some(job) = state.high.pop_front() {
            (job, false)
        } else if let Some(job) = state.med.pop_front() {
            (job, false)
        } else if let Some(job) = state.low.pop_front() {
            (job, false)
        } else {
            // Another worker beat us to the job; wait again.
            continue;
        };
        if !is_persistent {
            let waited = Instant::now().duration_since(job.enqueued);
            state.account_wait(job.priority, waited);
        }

        drop(state);

        (job.task)();

        state = shared.state.lock();
        if is_persistent {
            state.persistent_threads -= 1;
        }
        timed_out = false;
    }

    state.total_threads -= 1;
    shared.start_and_shutdown.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn attr(min: usize, max: usize) -> ThreadPoolAttr {
        ThreadPoolAttr {
            min_threads: min,
            max_threads: max,
            ..ThreadPoolAttr::default()
        }
    }

    #[test]
    fn runs_jobs_and_counts_them() {
        let pool = ThreadPool::start(attr(1, 2)).expect("start pool");
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.add_job(JobPriority::Med, move || {
                tx.send(i).unwrap();
            })
            .expect("enqueue");
        }
        let mut got: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        let stats = pool.stats();
        assert_eq!(stats.total_jobs_mq, 5);
        pool.shutdown();
    }

    #[test]
    fn high_runs_before_low_when_worker_frees_up() {
        let mut a = attr(1, 1);
        a.starvation_time = Duration::from_secs(60); // no bumping here
        let pool = ThreadPool::start(a).expect("start pool");
        let order = Arc::new(Mutex::new(Vec::new()));

        let (started_tx, started_rx) = mpsc::channel();
        pool.add_job(JobPriority::Med, move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
        })
        .unwrap();
        started_rx.recv().unwrap();

        for (prio, tag) in [(JobPriority::Low, "low"), (JobPriority::High, "high")] {
            let order = Arc::clone(&order);
            pool.add_job(prio, move || order.lock().push(tag)).unwrap();
        }
        pool.shutdown_after_drain();
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    /// Starvation bump: a low job waiting past `starvation_time` is promoted
    /// to the med queue head-first, so after the blocking job completes it is
    /// popped from med (visible in the per-queue stats), not from low.
    #[test]
    fn starved_low_job_is_promoted() {
        let mut a = attr(1, 1);
        a.starvation_time = Duration::from_millis(100);
        let pool = ThreadPool::start(a).expect("start pool");

        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        pool.add_job(JobPriority::Med, move || {
            started_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();
        started_rx.recv().unwrap();

        pool.add_job(JobPriority::Low, move || {
            done_tx.send(()).unwrap();
        })
        .unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("low job ran");
        pool.shutdown_after_drain();
        let stats = pool.stats();
        // The low job is accounted once in LQ (at promotion) and once in MQ
        // (when popped), alongside the blocking med job.
        assert_eq!(stats.total_jobs_lq, 1);
        assert_eq!(stats.total_jobs_mq, 2);
    }

    #[test]
    fn grows_under_load_up_to_max() {
        let mut a = attr(1, 4);
        a.jobs_per_thread = 1;
        let pool = ThreadPool::start(a).expect("start pool");
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            pool.add_job(JobPriority::Med, move || {
                let _ = gate.lock();
            })
            .unwrap();
        }
        let stats = pool.stats();
        assert!(stats.total_threads > 1, "expected growth, got {stats:?}");
        assert!(stats.total_threads <= 4);
        assert!(stats.max_threads_seen <= 4);
        drop(guard);
        pool.shutdown();
    }

    #[test]
    fn rejects_jobs_past_queue_ceiling() {
        let mut a = attr(1, 1);
        a.max_jobs_total = 2;
        let pool = ThreadPool::start(a).expect("start pool");
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.add_job(JobPriority::Med, move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv().unwrap();

        pool.add_job(JobPriority::Med, || {}).unwrap();
        pool.add_job(JobPriority::Med, || {}).unwrap();
        assert_eq!(
            pool.add_job(JobPriority::Low, || {}).unwrap_err(),
            PoolError::QueueFull
        );
        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_queued_jobs() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = ThreadPool::start(attr(1, 1)).expect("start pool");
        let dropped = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.add_job(JobPriority::Med, move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv().unwrap();

        for _ in 0..3 {
            let flag = DropFlag(Arc::clone(&dropped));
            let ran = Arc::clone(&ran);
            pool.add_job(JobPriority::Med, move || {
                let _keep = &flag;
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        release_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst) + dropped.load(Ordering::SeqCst), 3);
        assert!(pool.add_job(JobPriority::Med, || {}).is_err());
    }

    #[test]
    fn persistent_job_occupies_a_counted_worker() {
        let pool = ThreadPool::start(attr(1, 4)).expect("start pool");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.add_persistent(JobPriority::High, move || {
            let _ = release_rx.recv();
        })
        .expect("persistent accepted");
        let stats = pool.stats();
        assert_eq!(stats.persistent_threads, 1);
        // Regular jobs still run next to the persistent one.
        let (tx, rx) = mpsc::channel();
        pool.add_job(JobPriority::Med, move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn persistent_rejected_when_it_would_take_last_worker() {
        let pool = ThreadPool::start(attr(1, 2)).expect("start pool");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.add_persistent(JobPriority::High, move || {
            let _ = release_rx.recv();
        })
        .expect("first persistent fits");
        assert_eq!(
            pool.add_persistent(JobPriority::High, || {}).unwrap_err(),
            PoolError::MaxThreads
        );
        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn set_attr_raises_min_threads() {
        let pool = ThreadPool::start(attr(1, 4)).expect("start pool");
        let mut a = attr(3, 4);
        a.max_idle_time = Duration::from_secs(60);
        pool.set_attr(a).expect("set_attr");
        assert!(pool.stats().total_threads >= 3);
        pool.shutdown();
    }

    impl ThreadPool {
        /// Test helper: wait until the queues drain, then shut down.
        fn shutdown_after_drain(&self) {
            loop {
                let s = self.stats();
                if s.current_jobs_hq + s.current_jobs_mq + s.current_jobs_lq == 0
                    && s.total_threads == s.idle_threads + s.persistent_threads
                {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            self.shutdown();
        }
    }
}
