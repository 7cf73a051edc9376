use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Single-value channel backing `JoinHandle`: the task sends its output
/// once, the handle receives it once.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Mutex::new(Inner {
        value: None,
        sender_alive: true,
        receiver_alive: true,
        receiver_waker: None,
    }));
    (
        Sender {
            inner: Some(inner.clone()),
        },
        Receiver { inner },
    )
}

/// The sender was dropped without sending.
#[derive(Debug, PartialEq, Eq)]
pub struct Dropped;

struct Inner<T> {
    value: Option<T>,
    sender_alive: bool,
    receiver_alive: bool,
    receiver_waker: Option<Waker>,
}

pub struct Sender<T> {
    inner: Option<Arc<Mutex<Inner<T>>>>,
}

impl<T> Sender<T> {
    pub fn send(mut self, value: T) -> Result<(), T> {
        let inner = self.inner.take().expect("sender used twice");
        let mut guard = inner.lock().unwrap();
        if !guard.receiver_alive {
            return Err(value);
        }
        guard.value = Some(value);
        if let Some(waker) = guard.receiver_waker.take() {
            waker.wake();
        }
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut guard = inner.lock().unwrap();
            guard.sender_alive = false;
            if let Some(waker) = guard.receiver_waker.take() {
                waker.wake();
            }
        }
    }
}

pub struct Receiver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Receiver<T> {
    pub fn recv(self) -> RecvFuture<T> {
        RecvFuture { receiver: self }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.lock().unwrap().receiver_alive = false;
    }
}

pub struct RecvFuture<T> {
    receiver: Receiver<T>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Result<T, Dropped>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.receiver.inner.lock().unwrap();
        if let Some(value) = guard.value.take() {
            return Poll::Ready(Ok(value));
        }
        if !guard.sender_alive {
            return Poll::Ready(Err(Dropped));
        }
        guard.receiver_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
