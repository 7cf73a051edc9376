use std::sync::Arc;

use crate::executor::TaskId;
use crate::oneshot;
use crate::task::TaskShared;

/// Handle to a spawned fiber. Detached by default; `attach` ties the fiber's
/// lifetime to the handle so dropping it cancels the fiber.
pub struct JoinHandle<T> {
    shared: Arc<TaskShared>,
    receiver: Option<oneshot::Receiver<T>>,
    attached: bool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(shared: Arc<TaskShared>, receiver: oneshot::Receiver<T>) -> Self {
        Self {
            shared,
            receiver: Some(receiver),
            attached: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.shared.id
    }

    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Waits for the fiber to finish and returns its output. Only `cancel`
    /// on this handle can keep the fiber from completing, so the output is
    /// always produced.
    pub async fn join(mut self) -> T {
        self.attached = false;
        let receiver = self.receiver.take().expect("join called twice");
        receiver.recv().await.expect("task did not complete")
    }

    /// Cancels the fiber: its future is dropped at the next scheduling
    /// point. Returns the output if the fiber had already finished.
    pub async fn cancel(mut self) -> Option<T> {
        self.shared.cancel();
        self.attached = false;
        let receiver = self.receiver.take().expect("cancel called twice");
        receiver.recv().await.ok()
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.attached {
            self.shared.cancel();
        }
    }
}
