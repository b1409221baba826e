//! Worker pool and timer, the scheduling substrate for both engines.
//!
//! The pool runs callback and network-send jobs at three priorities with
//! starvation escalation; the timer is a single persistent pool job driving
//! an ordered queue of delayed jobs back into the pool.

mod thread_pool;
mod timer_thread;

pub use thread_pool::{
    JobPriority, PoolError, ThreadPool, ThreadPoolAttr, ThreadPoolStats,
};
pub use timer_thread::{TimerDuration, TimerId, TimerThread, When};
