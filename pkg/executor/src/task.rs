use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Wake;

use base_error::*;
use nix::sys::eventfd::{eventfd, EfdFlags};

use crate::channel;
use crate::executor::TaskId;
use crate::supervisor::TaskOutcome;

/// Queue of tasks that should be polled next. Wakers push into it from
/// anywhere; the run loop drains it. The eventfd nudge interrupts a blocking
/// poll when a wake arrives while the loop is waiting on I/O.
pub(crate) struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    wakeup_fd: RawFd,
}

impl ReadyQueue {
    pub fn create() -> Result<Self> {
        let wakeup_fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            queue: Mutex::new(VecDeque::new()),
            wakeup_fd,
        })
    }

    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_fd
    }

    pub fn push(&self, id: TaskId) {
        self.queue.lock().unwrap().push_back(id);
        let _ = nix::unistd::write(self.wakeup_fd, &1u64.to_ne_bytes());
    }

    pub fn pop(&self) -> Option<TaskId> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl Drop for ReadyQueue {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.wakeup_fd);
    }
}

/// Wake-side state of a task. The `scheduled` flag keeps a task from being
/// queued twice; it is cleared right before each poll.
pub(crate) struct TaskShared {
    pub id: TaskId,
    scheduled: AtomicBool,
    cancelled: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl TaskShared {
    /// New tasks start scheduled: the spawner pushes them onto the queue
    /// itself.
    pub fn new(id: TaskId, ready: Arc<ReadyQueue>) -> Self {
        Self {
            id,
            scheduled: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            ready,
        }
    }

    pub fn wake_task(&self) {
        if !self.scheduled.swap(true, Ordering::SeqCst) {
            self.ready.push(self.id);
        }
    }

    pub fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake_task();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Wake for TaskShared {
    fn wake(self: Arc<Self>) {
        self.wake_task();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_task();
    }
}

/// A task owned by the executor. The future is taken out while it is being
/// polled and put back if it stays pending.
pub(crate) struct TaskEntry {
    pub shared: Arc<TaskShared>,
    pub future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    /// Supervisor channel inherited by fibers this task spawns supervised.
    pub supervisor: Option<channel::Sender<TaskOutcome>>,
}
