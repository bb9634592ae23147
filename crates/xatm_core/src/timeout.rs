//! Transaction timeout scheduling.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// Thread name of the [`TaskScheduler`] worker.
pub const SCHEDULER_THREAD_NAME: &str = "xatm-timeout-scheduler";

/// Handle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// A callback run once its deadline passes.
pub type TimeoutTask = Box<dyn FnOnce() + Send>;

/// Runs callbacks at deadlines.
pub trait TimeoutScheduler: Send + Sync {
    /// Schedules `task` to run at `deadline`.
    fn schedule(&self, deadline: Instant, task: TimeoutTask) -> TaskId;

    /// Cancels a task. Returns false if it already ran or was never
    /// scheduled.
    fn cancel(&self, id: TaskId) -> bool;

    /// Stops the scheduler. Pending tasks are dropped without running.
    fn shutdown(&self);
}

#[derive(Default)]
struct Schedule {
    next_id: u64,
    tasks: BTreeMap<(Instant, TaskId), TimeoutTask>,
    deadlines: HashMap<TaskId, Instant>,
    stopped: bool,
}

struct Shared {
    schedule: Mutex<Schedule>,
    changed: Condvar,
}

/// [`TimeoutScheduler`] backed by one background thread.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Starts the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            changed: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(SCHEDULER_THREAD_NAME.to_string())
                .spawn(move || run(&shared))?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.schedule.lock().tasks.len()
    }
}

fn run(shared: &Shared) {
    let mut schedule = shared.schedule.lock();
    loop {
        if schedule.stopped {
            break;
        }
        let now = Instant::now();
        let due = match schedule.tasks.keys().next().copied() {
            Some((deadline, id)) if deadline <= now => Some((deadline, id)),
            Some((deadline, _)) => {
                shared.changed.wait_until(&mut schedule, deadline);
                None
            }
            None => {
                shared.changed.wait(&mut schedule);
                None
            }
        };
        if let Some(key) = due {
            schedule.deadlines.remove(&key.1);
            if let Some(task) = schedule.tasks.remove(&key) {
                debug!(task = ?key.1, "running timeout task");
                parking_lot::MutexGuard::unlocked(&mut schedule, task);
            }
        }
    }
    debug!("timeout scheduler stopped");
}

impl TimeoutScheduler for TaskScheduler {
    fn schedule(&self, deadline: Instant, task: TimeoutTask) -> TaskId {
        let mut schedule = self.shared.schedule.lock();
        schedule.next_id += 1;
        let id = TaskId(schedule.next_id);
        schedule.tasks.insert((deadline, id), task);
        schedule.deadlines.insert(id, deadline);
        self.shared.changed.notify_all();
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut schedule = self.shared.schedule.lock();
        match schedule.deadlines.remove(&id) {
            Some(deadline) => schedule.tasks.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    fn shutdown(&self) {
        {
            let mut schedule = self.shared.schedule.lock();
            schedule.stopped = true;
            schedule.tasks.clear();
            schedule.deadlines.clear();
            self.shared.changed.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("timeout scheduler thread panicked");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
