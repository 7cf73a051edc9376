use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Bounded multi-producer channel. `send` suspends while the queue is full;
/// `recv` suspends while it is empty. Used for fiber-to-fiber handoff and as
/// the supervisor queue of fiber exit messages.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Mutex::new(Inner {
        values: VecDeque::new(),
        capacity,
        senders: 1,
        receivers: 1,
        send_wakers: Vec::new(),
        recv_wakers: Vec::new(),
    }));
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

struct Inner<T> {
    values: VecDeque<T>,
    capacity: usize,
    senders: usize,
    receivers: usize,
    send_wakers: Vec<Waker>,
    recv_wakers: Vec<Waker>,
}

impl<T> Inner<T> {
    fn wake_senders(&mut self) {
        for waker in self.send_wakers.drain(..) {
            waker.wake();
        }
    }

    fn wake_receivers(&mut self) {
        for waker in self.recv_wakers.drain(..) {
            waker.wake();
        }
    }
}

/// All receivers dropped; the value comes back.
#[derive(Debug)]
pub struct SendError<T>(pub T);

#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

/// All senders dropped and the queue is drained.
#[derive(Debug, PartialEq, Eq)]
pub struct RecvError;

pub struct Sender<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.lock().unwrap().senders += 1;
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.senders -= 1;
        if inner.senders == 0 {
            inner.wake_receivers();
        }
    }
}

impl<T> Sender<T> {
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.receivers == 0 {
            return Err(TrySendError::Closed(value));
        }
        if inner.values.len() >= inner.capacity {
            return Err(TrySendError::Full(value));
        }
        inner.values.push_back(value);
        inner.wake_receivers();
        Ok(())
    }

    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            sender: self,
            value: Some(value),
        }
    }
}

pub struct SendFuture<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
}

impl<'a, T> Future for SendFuture<'a, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // No field of this future is ever pinned; the value moves out on
        // completion.
        let this = unsafe { self.get_unchecked_mut() };
        let mut inner = this.sender.inner.lock().unwrap();
        let value = this.value.take().expect("polled after completion");

        if inner.receivers == 0 {
            return Poll::Ready(Err(SendError(value)));
        }
        if inner.values.len() < inner.capacity {
            inner.values.push_back(value);
            inner.wake_receivers();
            return Poll::Ready(Ok(()));
        }

        this.value = Some(value);
        inner.send_wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

pub struct Receiver<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.inner.lock().unwrap().receivers += 1;
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.receivers -= 1;
        if inner.receivers == 0 {
            inner.wake_senders();
        }
    }
}

impl<T> Receiver<T> {
    pub fn try_recv(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.values.pop_front();
        if value.is_some() {
            inner.wake_senders();
        }
        value
    }

    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { receiver: self }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RecvFuture<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<'a, T> Future for RecvFuture<'a, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.receiver.inner.lock().unwrap();
        if let Some(value) = inner.values.pop_front() {
            inner.wake_senders();
            return Poll::Ready(Ok(value));
        }
        if inner.senders == 0 {
            return Poll::Ready(Err(RecvError));
        }
        inner.recv_wakers.push(cx.waker().clone());
        Poll::Pending
    }
}
