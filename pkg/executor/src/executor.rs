use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use base_error::*;
use log::debug;

use crate::channel;
use crate::join_handle::JoinHandle;
use crate::oneshot;
use crate::poller::Poller;
use crate::supervisor::TaskOutcome;
use crate::task::{ReadyQueue, TaskEntry, TaskShared};
use crate::thread_local::{with_context, ContextGuard};
use crate::timer::TimerQueue;

pub type TaskId = u64;

/// Single threaded cooperative scheduler. One instance drives all fibers on
/// its thread; fibers suspend only at explicit await points (I/O, timers,
/// channels).
pub(crate) struct ExecutorContext {
    pub(crate) ready: Arc<ReadyQueue>,
    pub(crate) tasks: RefCell<HashMap<TaskId, TaskEntry>>,
    next_task_id: Cell<TaskId>,
    pub(crate) poller: RefCell<Poller>,
    pub(crate) timers: RefCell<TimerQueue>,
    /// Supervisor channel of the task currently being polled.
    pub(crate) current_supervisor: RefCell<Option<channel::Sender<TaskOutcome>>>,
    running: Cell<bool>,
}

/// Runs `future` to completion on a fresh executor and returns its output.
/// All fibers spawned along the way stop when the main future finishes.
pub fn run<T: 'static, F: Future<Output = T> + 'static>(future: F) -> Result<T> {
    let ctx = Rc::new(ExecutorContext::create()?);
    let _guard = ContextGuard::install(ctx.clone());

    let output = Rc::new(RefCell::new(None));

    let main_output = output.clone();
    let main_ctx = ctx.clone();
    ctx.spawn(
        Box::pin(async move {
            let value = future.await;
            *main_output.borrow_mut() = Some(value);
            main_ctx.running.set(false);
        }),
        None,
    );

    let result = ctx.run_loop();

    // Tasks hold wakers and possibly clones of the context; dropping them
    // here breaks the reference cycle whether or not the loop succeeded.
    ctx.tasks.borrow_mut().clear();
    result?;

    let value = output
        .borrow_mut()
        .take()
        .ok_or_else(|| err_msg("executor stopped without finishing the main task"))?;
    Ok(value)
}

/// Spawns a fiber on the current executor.
pub fn spawn<T: 'static, F: Future<Output = T> + 'static>(future: F) -> JoinHandle<T> {
    with_context(|ctx| {
        let (sender, receiver) = oneshot::channel();
        let shared = ctx.spawn(
            Box::pin(async move {
                let _ = sender.send(future.await);
            }),
            None,
        );
        JoinHandle::new(shared, receiver)
    })
}

impl ExecutorContext {
    fn create() -> Result<Self> {
        let ready = Arc::new(ReadyQueue::create()?);
        let mut poller = Poller::create()?;
        poller.add_wakeup_fd(ready.wakeup_fd())?;

        Ok(Self {
            ready,
            tasks: RefCell::new(HashMap::new()),
            next_task_id: Cell::new(1),
            poller: RefCell::new(poller),
            timers: RefCell::new(TimerQueue::new()),
            current_supervisor: RefCell::new(None),
            running: Cell::new(true),
        })
    }

    pub(crate) fn allocate_task_id(&self) -> TaskId {
        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);
        id
    }

    pub(crate) fn spawn(
        &self,
        future: Pin<Box<dyn Future<Output = ()>>>,
        supervisor: Option<channel::Sender<TaskOutcome>>,
    ) -> Arc<TaskShared> {
        let id = self.allocate_task_id();
        self.spawn_with_id(id, future, supervisor)
    }

    pub(crate) fn spawn_with_id(
        &self,
        id: TaskId,
        future: Pin<Box<dyn Future<Output = ()>>>,
        supervisor: Option<channel::Sender<TaskOutcome>>,
    ) -> Arc<TaskShared> {
        let shared = Arc::new(TaskShared::new(id, self.ready.clone()));
        self.tasks.borrow_mut().insert(
            id,
            TaskEntry {
                shared: shared.clone(),
                future: Some(future),
                supervisor,
            },
        );
        self.ready.push(id);
        shared
    }

    fn run_loop(self: &Rc<Self>) -> Result<()> {
        debug!("executor started");
        while self.running.get() {
            while let Some(id) = self.ready.pop() {
                self.poll_task(id);
                if !self.running.get() {
                    break;
                }
            }
            if !self.running.get() {
                break;
            }

            let timeout = {
                let mut timers = self.timers.borrow_mut();
                timers
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };
            self.poller.borrow_mut().wait(timeout)?;
            self.timers.borrow_mut().fire_due(Instant::now());
        }
        debug!("executor stopped");
        Ok(())
    }

    fn poll_task(self: &Rc<Self>, id: TaskId) {
        let (shared, future, supervisor) = {
            let mut tasks = self.tasks.borrow_mut();
            let entry = match tasks.get_mut(&id) {
                Some(entry) => entry,
                // Already finished; a stale wake.
                None => return,
            };
            entry.shared.clear_scheduled();
            if entry.shared.is_cancelled() {
                let entry = tasks.remove(&id);
                drop(tasks);
                drop(entry);
                return;
            }
            match entry.future.take() {
                Some(future) => (entry.shared.clone(), future, entry.supervisor.clone()),
                None => return,
            }
        };

        let prev_supervisor = self.current_supervisor.replace(supervisor);

        let waker = Waker::from(shared.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = future;
        let done = matches!(future.as_mut().poll(&mut cx), Poll::Ready(()));

        self.current_supervisor.replace(prev_supervisor);

        if done {
            drop(future);
            self.tasks.borrow_mut().remove(&id);
        } else if let Some(entry) = self.tasks.borrow_mut().get_mut(&id) {
            entry.future = Some(future);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_the_main_value() {
        assert_eq!(run(async { 42 }).unwrap(), 42);
    }

    #[test]
    fn spawn_and_join() {
        let total = run(async {
            let a = spawn(async { 3 });
            let b = spawn(async { 4 });
            a.join().await + b.join().await
        })
        .unwrap();
        assert_eq!(total, 7);
    }

    #[test]
    fn fibers_interleave_through_channels() {
        run(async {
            let (tx, rx) = channel::bounded::<u32>(1);
            let echo = spawn(async move {
                let mut last = 0;
                while let Ok(v) = rx.recv().await {
                    last = v;
                }
                last
            });

            for i in 1..=5 {
                tx.send(i).await.ok().unwrap();
            }
            drop(tx);
            assert_eq!(echo.join().await, 5);
        })
        .unwrap();
    }

    #[test]
    fn cancelled_fiber_never_finishes() {
        run(async {
            let pending = spawn(async {
                crate::timer::sleep(std::time::Duration::from_secs(30)).await;
                1
            });
            assert_eq!(pending.cancel().await, None);
        })
        .unwrap();
    }
}
