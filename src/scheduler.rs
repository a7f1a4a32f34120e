//! Serial task queues over a shared virtual-time scheduler.
//!
//! Each [`TaskQueue`] is strictly serial: tasks posted on the same queue run
//! in post order, delayed tasks run in non-decreasing deadline order, and a
//! task posting onto its own queue re-enters the scheduler instead of running
//! inline. All queues created from one [`Scheduler`] share a single ready
//! heap, so interleaving between queues is deterministic under simulated
//! time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::units::{TimeDelta, Timestamp};

/// What a repeating task wants to happen after an invocation.
pub enum RepeatDecision {
    /// Run again after this much time.
    After(TimeDelta),
    /// Stop; the closure is dropped on the owning queue.
    Stop,
}

enum TaskKind {
    Once(Box<dyn FnOnce() + Send>),
    Repeating(Box<dyn FnMut() -> RepeatDecision + Send>),
}

struct ScheduledTask {
    deadline: Timestamp,
    seq: u64,
    queue_id: u32,
    cancelled: Arc<AtomicBool>,
    kind: TaskKind,
}

// Heap entries order by (deadline, seq); the seq tiebreak preserves FIFO
// between tasks that share a deadline.
impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledTask {}
impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

#[derive(Default)]
struct SchedulerCore {
    heap: BinaryHeap<ScheduledTask>,
    next_seq: u64,
    next_queue_id: u32,
}

/// Shared scheduler state. Cheap to clone; all clones feed the same heap.
#[derive(Clone, Default)]
pub struct Scheduler {
    core: Arc<Mutex<SchedulerCore>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: &str) -> TaskQueue {
        let mut core = self.core.lock().unwrap();
        let id = core.next_queue_id;
        core.next_queue_id += 1;
        TaskQueue {
            id,
            name: name.to_owned(),
            scheduler: self.clone(),
        }
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.core.lock().unwrap().heap.peek().map(|t| t.deadline)
    }

    /// Runs the single earliest task whose deadline has passed, if any.
    /// The scheduler lock is not held while the task body runs, so tasks can
    /// freely post more tasks.
    pub fn run_one_due(&self, now: Timestamp) -> bool {
        let task = {
            let mut core = self.core.lock().unwrap();
            match core.heap.peek() {
                Some(t) if t.deadline <= now => core.heap.pop(),
                _ => None,
            }
        };
        let Some(task) = task else {
            return false;
        };
        if task.cancelled.load(Ordering::Acquire) {
            // The closure is dropped here, on the owning queue.
            tracing::trace!(queue = task.queue_id, "dropping cancelled task");
            return true;
        }
        match task.kind {
            TaskKind::Once(f) => f(),
            TaskKind::Repeating(mut f) => match f() {
                RepeatDecision::After(delay) => {
                    debug_assert!(delay >= TimeDelta::zero());
                    self.push(task.queue_id, now + delay, task.cancelled, TaskKind::Repeating(f));
                }
                RepeatDecision::Stop => {}
            },
        }
        true
    }

    fn push(
        &self,
        queue_id: u32,
        deadline: Timestamp,
        cancelled: Arc<AtomicBool>,
        kind: TaskKind,
    ) {
        let mut core = self.core.lock().unwrap();
        let seq = core.next_seq;
        core.next_seq += 1;
        core.heap.push(ScheduledTask {
            deadline,
            seq,
            queue_id,
            cancelled,
            kind,
        });
    }
}

/// Handle to a serial queue. Dropping the handle does not cancel pending
/// tasks; individual task handles do that.
pub struct TaskQueue {
    id: u32,
    name: String,
    scheduler: Scheduler,
}

impl TaskQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts a task to run at the current front of the queue.
    pub fn post(&self, now: Timestamp, f: impl FnOnce() + Send + 'static) {
        self.scheduler
            .push(self.id, now, Arc::new(AtomicBool::new(false)), TaskKind::Once(Box::new(f)));
    }

    /// Posts a task to run `delay` from `now`. The returned handle cancels it.
    pub fn post_delayed(
        &self,
        now: Timestamp,
        delay: TimeDelta,
        f: impl FnOnce() + Send + 'static,
    ) -> TaskHandle {
        debug_assert!(delay >= TimeDelta::zero());
        let cancelled = Arc::new(AtomicBool::new(false));
        self.scheduler.push(
            self.id,
            now + delay,
            Arc::clone(&cancelled),
            TaskKind::Once(Box::new(f)),
        );
        TaskHandle { cancelled }
    }

    /// Starts a repeating task. The closure returns the delay until its next
    /// invocation, or [`RepeatDecision::Stop`] to end the repetition.
    pub fn start_repeating(
        &self,
        now: Timestamp,
        initial_delay: TimeDelta,
        f: impl FnMut() -> RepeatDecision + Send + 'static,
    ) -> TaskHandle {
        debug_assert!(initial_delay >= TimeDelta::zero());
        let cancelled = Arc::new(AtomicBool::new(false));
        self.scheduler.push(
            self.id,
            now + initial_delay,
            Arc::clone(&cancelled),
            TaskKind::Repeating(Box::new(f)),
        );
        TaskHandle { cancelled }
    }
}

/// Cancellation handle for a delayed or repeating task.
///
/// After `stop` returns (or the handle is dropped), the task body will not
/// run again; the closure itself is dropped the next time the owning queue
/// reaches the cancelled entry.
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
