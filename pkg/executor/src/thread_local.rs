use std::cell::RefCell;
use std::rc::Rc;

use crate::executor::ExecutorContext;

thread_local! {
    static CURRENT_EXECUTOR: RefCell<Option<Rc<ExecutorContext>>> = RefCell::new(None);
}

/// Installs an executor as the thread's current one for the duration of its
/// run loop; restores the previous executor (if any) on drop.
pub(crate) struct ContextGuard {
    prev: Option<Rc<ExecutorContext>>,
}

impl ContextGuard {
    pub fn install(ctx: Rc<ExecutorContext>) -> Self {
        let prev = CURRENT_EXECUTOR.with(|current| current.borrow_mut().replace(ctx));
        Self { prev }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_EXECUTOR.with(|current| *current.borrow_mut() = prev);
    }
}

pub(crate) fn try_with_context<R>(f: impl FnOnce(&Rc<ExecutorContext>) -> R) -> Option<R> {
    let ctx = CURRENT_EXECUTOR.with(|current| current.borrow().clone());
    ctx.map(|ctx| f(&ctx))
}

pub(crate) fn with_context<R>(f: impl FnOnce(&Rc<ExecutorContext>) -> R) -> R {
    try_with_context(f).expect("not running inside an executor")
}
