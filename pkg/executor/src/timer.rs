use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::thread_local::{try_with_context, with_context};

type TimerId = u64;

/// Deadline heap consulted by the run loop for its poll timeout. Removed
/// timers leave stale heap entries behind; they are skipped lazily when the
/// heap is inspected.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    wakers: HashMap<TimerId, Waker>,
    next_id: TimerId,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            wakers: HashMap::new(),
            next_id: 0,
        }
    }

    fn register(&mut self, deadline: Instant, waker: Waker) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Reverse((deadline, id)));
        self.wakers.insert(id, waker);
        id
    }

    fn update(&mut self, id: TimerId, waker: Waker) {
        if let Some(slot) = self.wakers.get_mut(&id) {
            *slot = waker;
        }
    }

    fn remove(&mut self, id: TimerId) {
        self.wakers.remove(&id);
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.wakers.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(waker) = self.wakers.remove(&id) {
                waker.wake();
            }
        }
    }
}

/// Suspends the current fiber for at least `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        timer_id: None,
    }
}

pub struct Sleep {
    deadline: Instant,
    timer_id: Option<TimerId>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if Instant::now() >= this.deadline {
            if let Some(id) = this.timer_id.take() {
                try_with_context(|ctx| ctx.timers.borrow_mut().remove(id));
            }
            return Poll::Ready(());
        }

        match this.timer_id {
            Some(id) => with_context(|ctx| ctx.timers.borrow_mut().update(id, cx.waker().clone())),
            None => {
                this.timer_id = Some(with_context(|ctx| {
                    ctx.timers
                        .borrow_mut()
                        .register(this.deadline, cx.waker().clone())
                }));
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer_id.take() {
            try_with_context(|ctx| ctx.timers.borrow_mut().remove(id));
        }
    }
}

/// Runs `future` with a deadline. Resolves to `None` when the deadline fires
/// first, which is how timed-out I/O reports "nil"; the inner future (and
/// any listener it registered) is dropped at that point.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
    }
}

pub struct Timeout<F> {
    future: F,
    sleep: Sleep,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };

        if let Poll::Ready(value) = unsafe { Pin::new_unchecked(&mut this.future) }.poll(cx) {
            return Poll::Ready(Some(value));
        }
        if Pin::new(&mut this.sleep).poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_waits_long_enough() {
        crate::run(async {
            let start = Instant::now();
            sleep(Duration::from_millis(50)).await;
            assert!(start.elapsed() >= Duration::from_millis(50));
        })
        .unwrap();
    }

    #[test]
    fn sleeps_complete_in_deadline_order() {
        crate::run(async {
            let long = crate::spawn(async {
                sleep(Duration::from_millis(80)).await;
                Instant::now()
            });
            let short = crate::spawn(async {
                sleep(Duration::from_millis(10)).await;
                Instant::now()
            });
            assert!(short.join().await < long.join().await);
        })
        .unwrap();
    }

    #[test]
    fn timeout_returns_none_on_expiry() {
        crate::run(async {
            let result = timeout(Duration::from_millis(20), sleep(Duration::from_secs(30))).await;
            assert_eq!(result, None);
        })
        .unwrap();
    }

    #[test]
    fn timeout_passes_fast_futures_through() {
        crate::run(async {
            let result = timeout(Duration::from_secs(5), async { 9 }).await;
            assert_eq!(result, Some(9));
        })
        .unwrap();
    }
}
