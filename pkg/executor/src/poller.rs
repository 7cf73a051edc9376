use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use base_error::*;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::thread_local::{try_with_context, with_context};

/// Event delivered to a pending I/O listener. The readiness backend
/// synthesises `Readable`/`Writable` from epoll; `Closed` is synthesised when
/// the stream owning the descriptor is closed under the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Readable,
    Writable,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Marker for the eventfd that interrupts a blocking wait.
const WAKEUP_TOKEN: u64 = u64::MAX;

/// Per-pending-operation record: destroyed when its event fires, when the
/// waiting future is dropped, or when the descriptor is closed.
struct Listener {
    waker: Waker,
    delivered: Rc<Cell<Option<IoEvent>>>,
}

#[derive(Default)]
struct FdEntry {
    read: Option<Listener>,
    write: Option<Listener>,
}

impl FdEntry {
    fn mask(&self) -> EpollFlags {
        let mut mask = EpollFlags::empty();
        if self.read.is_some() {
            mask |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        }
        if self.write.is_some() {
            mask |= EpollFlags::EPOLLOUT;
        }
        mask
    }

    fn slot(&mut self, interest: Interest) -> &mut Option<Listener> {
        match interest {
            Interest::Read => &mut self.read,
            Interest::Write => &mut self.write,
        }
    }
}

/// Readiness driver: level triggered epoll with at most one listener per
/// descriptor direction.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    wakeup_fd: Option<RawFd>,
    entries: HashMap<RawFd, FdEntry>,
}

impl Poller {
    pub fn create() -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll_fd,
            wakeup_fd: None,
            entries: HashMap::new(),
        })
    }

    pub fn add_wakeup_fd(&mut self, fd: RawFd) -> Result<()> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, WAKEUP_TOKEN);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)?;
        self.wakeup_fd = Some(fd);
        Ok(())
    }

    fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        waker: Waker,
        delivered: Rc<Cell<Option<IoEvent>>>,
    ) -> Result<()> {
        let (old_mask, new_mask) = {
            let entry = self.entries.entry(fd).or_default();
            let old_mask = entry.mask();
            let slot = entry.slot(interest);
            match slot {
                // Re-poll of the listener that owns the slot.
                Some(listener) if Rc::ptr_eq(&listener.delivered, &delivered) => {
                    listener.waker = waker;
                    return Ok(());
                }
                Some(_) => {
                    return Err(err_msg(
                        "stream already has a pending operation in this direction",
                    ));
                }
                None => {
                    *slot = Some(Listener { waker, delivered });
                }
            }
            (old_mask, entry.mask())
        };

        if let Err(error) = self.update_epoll(fd, old_mask, new_mask) {
            let now_empty = match self.entries.get_mut(&fd) {
                Some(entry) => {
                    *entry.slot(interest) = None;
                    entry.mask().is_empty()
                }
                None => false,
            };
            if now_empty {
                self.entries.remove(&fd);
            }
            return Err(error);
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, interest: Interest, delivered: &Rc<Cell<Option<IoEvent>>>) {
        let (old_mask, new_mask) = match self.entries.get_mut(&fd) {
            Some(entry) => {
                let old_mask = entry.mask();
                let slot = entry.slot(interest);
                match slot {
                    Some(listener) if Rc::ptr_eq(&listener.delivered, delivered) => *slot = None,
                    _ => return,
                }
                (old_mask, entry.mask())
            }
            None => return,
        };
        if new_mask.is_empty() {
            self.entries.remove(&fd);
        }
        let _ = self.update_epoll(fd, old_mask, new_mask);
    }

    /// Delivers `Closed` to every listener pending on `fd` and forgets the
    /// descriptor. Called before the owning stream releases the fd.
    pub fn close_fd(&mut self, fd: RawFd) {
        if let Some(mut entry) = self.entries.remove(&fd) {
            let old_mask = entry.mask();
            for listener in [entry.read.take(), entry.write.take()].into_iter().flatten() {
                listener.delivered.set(Some(IoEvent::Closed));
                listener.waker.wake();
            }
            let _ = self.update_epoll(fd, old_mask, EpollFlags::empty());
        }
    }

    fn update_epoll(&mut self, fd: RawFd, old: EpollFlags, new: EpollFlags) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if new.is_empty() {
            epoll_ctl(
                self.epoll_fd,
                EpollOp::EpollCtlDel,
                fd,
                None as Option<&mut EpollEvent>,
            )?;
        } else {
            let op = if old.is_empty() {
                EpollOp::EpollCtlAdd
            } else {
                EpollOp::EpollCtlMod
            };
            let mut event = EpollEvent::new(new, fd as u64);
            epoll_ctl(self.epoll_fd, op, fd, &mut event)?;
        }
        Ok(())
    }

    /// Blocks until an event arrives, the wakeup eventfd is nudged, or the
    /// timeout elapses, then fires the matching listeners.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout_ms: isize = match timeout {
            Some(d) if d == Duration::ZERO => 0,
            // Round up so a deadline a fraction of a millisecond away does
            // not spin.
            Some(d) => d.as_millis().min(i32::MAX as u128) as isize + 1,
            None => -1,
        };

        let mut events = [EpollEvent::empty(); 16];
        let count = match epoll_wait(self.epoll_fd, &mut events, timeout_ms) {
            Ok(count) => count,
            Err(e) if e.as_errno() == Some(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(format_err!("epoll_wait failed: {}", e)),
        };

        for event in &events[..count] {
            if event.data() == WAKEUP_TOKEN {
                if let Some(fd) = self.wakeup_fd {
                    let mut drain = [0u8; 8];
                    let _ = nix::unistd::read(fd, &mut drain);
                }
                continue;
            }

            let fd = event.data() as RawFd;
            let flags = event.events();
            let read_ready = flags.intersects(
                EpollFlags::EPOLLIN
                    | EpollFlags::EPOLLRDHUP
                    | EpollFlags::EPOLLHUP
                    | EpollFlags::EPOLLERR,
            );
            let write_ready =
                flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
            self.deliver(fd, read_ready, write_ready);
        }
        Ok(())
    }

    fn deliver(&mut self, fd: RawFd, read_ready: bool, write_ready: bool) {
        let (old_mask, new_mask) = match self.entries.get_mut(&fd) {
            Some(entry) => {
                let old_mask = entry.mask();
                if read_ready {
                    if let Some(listener) = entry.read.take() {
                        listener.delivered.set(Some(IoEvent::Readable));
                        listener.waker.wake();
                    }
                }
                if write_ready {
                    if let Some(listener) = entry.write.take() {
                        listener.delivered.set(Some(IoEvent::Writable));
                        listener.waker.wake();
                    }
                }
                (old_mask, entry.mask())
            }
            None => return,
        };
        if new_mask.is_empty() {
            self.entries.remove(&fd);
        }
        let _ = self.update_epoll(fd, old_mask, new_mask);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epoll_fd);
    }
}

/// Suspends the current fiber until `fd` reports the requested readiness or
/// its stream is closed. At most one fiber may wait per direction per
/// descriptor; a second waiter is a programmer error and raises.
pub fn wait_io(fd: RawFd, interest: Interest) -> IoEventFuture {
    IoEventFuture {
        fd,
        interest,
        delivered: Rc::new(Cell::new(None)),
        registered: false,
    }
}

/// Wakes every fiber pending on `fd` with a `Closed` event and drops their
/// listener records. Call before closing the descriptor itself.
pub fn close_io(fd: RawFd) {
    try_with_context(|ctx| ctx.poller.borrow_mut().close_fd(fd));
}

pub struct IoEventFuture {
    fd: RawFd,
    interest: Interest,
    delivered: Rc<Cell<Option<IoEvent>>>,
    registered: bool,
}

impl Future for IoEventFuture {
    type Output = Result<IoEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(event) = this.delivered.take() {
            this.registered = false;
            return Poll::Ready(Ok(event));
        }

        let registration = with_context(|ctx| {
            ctx.poller.borrow_mut().register(
                this.fd,
                this.interest,
                cx.waker().clone(),
                this.delivered.clone(),
            )
        });
        match registration {
            Ok(()) => {
                this.registered = true;
                Poll::Pending
            }
            Err(error) => Poll::Ready(Err(error)),
        }
    }
}

impl Drop for IoEventFuture {
    fn drop(&mut self) {
        // Cancelled (e.g. by a timeout) while still pending: the listener
        // record dies with the future.
        if self.registered && self.delivered.get().is_none() {
            try_with_context(|ctx| {
                ctx.poller
                    .borrow_mut()
                    .unregister(self.fd, self.interest, &self.delivered)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn pair() -> (RawFd, RawFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn readable_after_peer_writes() {
        crate::run(async {
            let (a, b) = pair();
            nix::unistd::write(a, b"x").unwrap();
            let event = wait_io(b, Interest::Read).await.unwrap();
            assert_eq!(event, IoEvent::Readable);
            nix::unistd::close(a).unwrap();
            nix::unistd::close(b).unwrap();
        })
        .unwrap();
    }

    #[test]
    fn close_wakes_pending_listener() {
        crate::run(async {
            let (a, b) = pair();
            let waiter = crate::spawn(async move { wait_io(b, Interest::Read).await.unwrap() });
            crate::sleep(std::time::Duration::from_millis(20)).await;
            close_io(b);
            assert_eq!(waiter.join().await, IoEvent::Closed);
            nix::unistd::close(a).unwrap();
            nix::unistd::close(b).unwrap();
        })
        .unwrap();
    }

    #[test]
    fn second_listener_in_same_direction_raises() {
        crate::run(async {
            let (a, b) = pair();
            let _first = crate::spawn(async move {
                let _ = wait_io(b, Interest::Read).await;
            });
            crate::sleep(std::time::Duration::from_millis(20)).await;
            let second = wait_io(b, Interest::Read).await;
            assert!(second.is_err());
            nix::unistd::close(a).unwrap();
            nix::unistd::close(b).unwrap();
        })
        .unwrap();
    }
}
