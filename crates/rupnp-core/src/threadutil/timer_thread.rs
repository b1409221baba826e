//! Ordered timer driving delayed jobs into the worker pool.
//!
//! The timer itself runs as one persistent pool job. It keeps a queue of
//! events sorted by due time (monotonic clock), with FIFO order among equal
//! due times, and hands each due event to the pool with its recorded
//! priority and persistence. Accuracy is best-effort: dispatch order is
//! guaranteed, lateness bounds are not.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use super::thread_pool::{JobPriority, PoolError, Task, ThreadPool};

pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDuration {
    ShortTerm,
    /// The fired job occupies a pool worker persistently.
    Persistent,
}

/// How the caller expresses the fire time.
#[derive(Debug, Clone, Copy)]
pub enum When {
    /// Seconds since the Unix epoch.
    AbsoluteSecs(u64),
    RelativeSecs(u64),
    RelativeMillis(u64),
    Deadline(SystemTime),
}

impl When {
    /// Convert to the monotonic clock. Wall-clock inputs in the past fire
    /// immediately.
    fn due_instant(self) -> Instant {
        let now = Instant::now();
        match self {
            When::RelativeSecs(s) => now + Duration::from_secs(s),
            When::RelativeMillis(ms) => now + Duration::from_millis(ms),
            When::AbsoluteSecs(secs) => {
                let target = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
                Self::wallclock_to_instant(target, now)
            }
            When::Deadline(target) => Self::wallclock_to_instant(target, now),
        }
    }

    fn wallclock_to_instant(target: SystemTime, now: Instant) -> Instant {
        match target.duration_since(SystemTime::now()) {
            Ok(ahead) => now + ahead,
            Err(_) => now,
        }
    }
}

struct TimerEvent {
    id: TimerId,
    due: Instant,
    persistence: TimerDuration,
    priority: JobPriority,
    task: Task,
}

struct TimerState {
    /// Sorted by `due`, FIFO among equal due times.
    queue: Vec<TimerEvent>,
    next_id: TimerId,
    shutdown: bool,
    worker_done: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condition: Condvar,
}

pub struct TimerThread {
    shared: Arc<TimerShared>,
}

impl TimerThread {
    /// Install the timer loop as a persistent job on `pool`. Blocks until a
    /// worker has picked the loop up.
    pub fn start(pool: &ThreadPool) -> Result<Self, PoolError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: Vec::new(),
                next_id: 0,
                shutdown: false,
                worker_done: false,
            }),
            condition: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let loop_pool = pool.clone();
        pool.add_persistent(JobPriority::High, move || {
            timer_loop(loop_shared, loop_pool);
        })?;
        Ok(Self { shared })
    }

    /// Schedule `task` to be handed to the pool at `when`. Returns the event
    /// id usable with [`TimerThread::remove`].
    pub fn schedule(
        &self,
        persistence: TimerDuration,
        when: When,
        priority: JobPriority,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<TimerId, PoolError> {
        let due = when.due_instant();
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        let id = state.next_id;
        state.next_id += 1;
        // Insert after any event with the same due time: equal-time events
        // dispatch in schedule order.
        let at = state.queue.partition_point(|e| e.due <= due);
        state.queue.insert(
            at,
            TimerEvent {
                id,
                due,
                persistence,
                priority,
                task: Box::new(task),
            },
        );
        self.shared.condition.notify_all();
        Ok(id)
    }

    /// Cancel a not-yet-dispatched event, dropping its task. Returns false
    /// if the event already left the queue (dispatched, cancelled earlier,
    /// or never existed).
    pub fn remove(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        match state.queue.iter().position(|e| e.id == id) {
            Some(at) => {
                state.queue.remove(at);
                self.shared.condition.notify_all();
                true
            }
            None => false,
        }
    }

    /// Drop every queued event and stop the loop. Blocks until the loop job
    /// acknowledges. Call before shutting the pool down.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.queue.clear();
        self.shared.condition.notify_all();
        while !state.worker_done {
            self.shared.condition.wait(&mut state);
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>, pool: ThreadPool) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            state.worker_done = true;
            shared.condition.notify_all();
            return;
        }
        let now = Instant::now();
        match state.queue.first().map(|e| e.due) {
            Some(due) if due <= now => {
                let event = state.queue.remove(0);
                let id = event.id;
                let result = match event.persistence {
                    TimerDuration::Persistent => {
                        pool.add_persistent_boxed(event.priority, event.task)
                    }
                    TimerDuration::ShortTerm => pool.add_job_boxed(event.priority, event.task),
                };
                if let Err(e) = result {
                    // The task was dropped by the pool; nothing leaks.
                    log::warn!("timer: pool rejected due event {id}: {e}");
                }
            }
            Some(due) => {
                shared.condition.wait_until(&mut state, due);
            }
            None => {
                shared.condition.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threadutil::ThreadPoolAttr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    // One regular worker next to the timer's persistent one, so fired jobs
    // complete in dispatch order and the ordering assertions hold.
    fn pool() -> ThreadPool {
        ThreadPool::start(ThreadPoolAttr {
            min_threads: 1,
            max_threads: 2,
            ..ThreadPoolAttr::default()
        })
        .expect("start pool")
    }

    #[test]
    fn fires_in_due_order_with_fifo_ties() {
        let pool = pool();
        let timer = TimerThread::start(&pool).expect("start timer");
        let (tx, rx) = mpsc::channel();

        for (tag, delay_ms) in [("late-a", 80u64), ("early", 20), ("late-b", 80)] {
            let tx = tx.clone();
            timer
                .schedule(
                    TimerDuration::ShortTerm,
                    When::RelativeMillis(delay_ms),
                    JobPriority::Med,
                    move || tx.send(tag).unwrap(),
                )
                .expect("schedule");
        }
        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "late-a", "late-b"]);
        timer.shutdown();
        pool.shutdown();
    }

    #[test]
    fn remove_cancels_and_frees_before_dispatch() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = pool();
        let timer = TimerThread::start(&pool).expect("start timer");
        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(Arc::clone(&dropped));
        let id = timer
            .schedule(
                TimerDuration::ShortTerm,
                When::RelativeSecs(30),
                JobPriority::Med,
                move || {
                    let _keep = &flag;
                    panic!("cancelled event must not run");
                },
            )
            .expect("schedule");

        assert!(timer.remove(id));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        // Second remove reports "already gone".
        assert!(!timer.remove(id));
        timer.shutdown();
        pool.shutdown();
    }

    #[test]
    fn wallclock_deadline_fires() {
        let pool = pool();
        let timer = TimerThread::start(&pool).expect("start timer");
        let (tx, rx) = mpsc::channel();
        timer
            .schedule(
                TimerDuration::ShortTerm,
                When::Deadline(SystemTime::now() + Duration::from_millis(50)),
                JobPriority::Med,
                move || tx.send(()).unwrap(),
            )
            .expect("schedule");
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
        timer.shutdown();
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_events() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = pool();
        let timer = TimerThread::start(&pool).expect("start timer");
        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = DropFlag(Arc::clone(&dropped));
        timer
            .schedule(
                TimerDuration::ShortTerm,
                When::RelativeSecs(60),
                JobPriority::Med,
                move || {
                    let _keep = &flag;
                },
            )
            .expect("schedule");
        timer.shutdown();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(timer
            .schedule(
                TimerDuration::ShortTerm,
                When::RelativeMillis(1),
                JobPriority::Med,
                || {}
            )
            .is_err());
        pool.shutdown();
    }
}
