//! Bounded fetch pool.
//!
//! A fixed number of scoped worker threads drain one shared task queue and
//! push into one shared results sink. Workers hold no other shared state, so
//! the sink's order depends on scheduling; callers sort what they read back.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;

/// Run `work` over every task with at most `concurrency` threads.
///
/// Results are returned in completion order.
pub fn run_bounded<T, R, F>(tasks: Vec<T>, concurrency: usize, work: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = concurrency.max(1).min(total);
    let queue = Mutex::new(VecDeque::from(tasks));
    let sink = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = match queue.lock() {
                        Ok(mut guard) => guard.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some(task) = next else { break };
                    let result = work(task);
                    match sink.lock() {
                        Ok(mut guard) => guard.push(result),
                        Err(poisoned) => poisoned.into_inner().push(result),
                    }
                }
            });
        }
    });

    sink.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}
