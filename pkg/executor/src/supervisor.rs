use std::future::Future;

use base_error::*;
use log::{debug, warn};

use crate::channel;
use crate::executor::TaskId;
use crate::thread_local::with_context;

/// Exit message of a supervised fiber, delivered to its supervisor channel
/// whether the fiber returned cleanly or raised.
pub struct TaskOutcome {
    pub task: TaskId,
    pub result: Result<()>,
}

/// Creates a bounded queue of fiber exit messages. The sender half is what
/// gets attached to fibers; keep the receiver to observe children.
pub fn supervisor_channel(
    capacity: usize,
) -> (channel::Sender<TaskOutcome>, channel::Receiver<TaskOutcome>) {
    channel::bounded(capacity)
}

/// Supervisor channel of the fiber currently running, if it has one.
pub fn current_supervisor() -> Option<channel::Sender<TaskOutcome>> {
    with_context(|ctx| ctx.current_supervisor.borrow().clone())
}

/// Spawns a fiber that inherits the current fiber's supervisor channel and
/// reports its exit there. This is how servers hand connection handlers to
/// the supervisor of the accepting fiber.
pub fn spawn_supervised<F: Future<Output = Result<()>> + 'static>(future: F) -> TaskId {
    spawn_supervised_impl(future, current_supervisor())
}

/// Spawns a fiber supervised by an explicit channel.
pub fn spawn_with_supervisor<F: Future<Output = Result<()>> + 'static>(
    future: F,
    supervisor: channel::Sender<TaskOutcome>,
) -> TaskId {
    spawn_supervised_impl(future, Some(supervisor))
}

fn spawn_supervised_impl<F: Future<Output = Result<()>> + 'static>(
    future: F,
    supervisor: Option<channel::Sender<TaskOutcome>>,
) -> TaskId {
    with_context(|ctx| {
        let id = ctx.allocate_task_id();
        let delivery = supervisor.clone();
        let wrapped = Box::pin(async move {
            let result = future.await;
            if let Err(error) = &result {
                debug!("supervised task {} raised: {}", id, error);
            }
            if let Some(supervisor) = delivery {
                if supervisor.try_send(TaskOutcome { task: id, result }).is_err() {
                    warn!("supervisor queue rejected exit message of task {}", id);
                }
            }
        });
        ctx.spawn_with_id(id, wrapped, supervisor);
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_child_results() {
        crate::run(async {
            let (tx, rx) = supervisor_channel(8);
            let ok_task = spawn_with_supervisor(async { Ok(()) }, tx.clone());
            let failed_task = spawn_with_supervisor(async { Err(err_msg("boom")) }, tx.clone());

            let mut outcomes = Vec::new();
            for _ in 0..2 {
                outcomes.push(rx.recv().await.unwrap());
            }
            outcomes.sort_by_key(|o| o.task);

            assert_eq!(outcomes[0].task, ok_task);
            assert!(outcomes[0].result.is_ok());
            assert_eq!(outcomes[1].task, failed_task);
            assert!(outcomes[1].result.is_err());
        })
        .unwrap();
    }

    #[test]
    fn children_inherit_the_supervisor() {
        crate::run(async {
            let (tx, rx) = supervisor_channel(8);
            spawn_with_supervisor(
                async {
                    // Grandchild reports to the same queue.
                    spawn_supervised(async { Err(err_msg("inner")) });
                    Ok(())
                },
                tx,
            );

            let mut failures = 0;
            for _ in 0..2 {
                if rx.recv().await.unwrap().result.is_err() {
                    failures += 1;
                }
            }
            assert_eq!(failures, 1);
        })
        .unwrap();
    }
}
