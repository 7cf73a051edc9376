use std::future::Future;
use std::time::Duration;

use base_error::*;
use executor::{wait_io, Interest, IoEvent};
use nix::errno::Errno;
use nix::sys::socket::{recv, recvfrom, send, sendto, MsgFlags};

use crate::address::SocketAddress;
use crate::stream::{Stream, StreamFlags};

/// Receive buffers are refilled in slices of at most this size.
const RECV_SLICE: usize = 65536;

/// How much to read: up to `Bytes(n)`, or everything until end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLimit {
    Bytes(usize),
    All,
}

impl From<usize> for ReadLimit {
    fn from(n: usize) -> Self {
        ReadLimit::Bytes(n)
    }
}

/// Applies the per-call timeout contract: expiry abandons the pending
/// operation (its listener dies with the dropped future) and yields nil.
pub(crate) async fn maybe_timeout<T, F>(timeout: Option<Duration>, op: F) -> Result<Option<T>>
where
    F: Future<Output = Result<Option<T>>>,
{
    match timeout {
        Some(duration) => match executor::timeout(duration, op).await {
            Some(result) => result,
            None => Ok(None),
        },
        None => op.await,
    }
}

impl Stream {
    /// Suspends until some bytes arrive and appends them to `buf`. With
    /// `Bytes(n)` it returns once at least one byte (up to `n`) is in; with
    /// `All` it keeps going to end of stream. Returns the byte count, or nil
    /// on timeout or (for `Bytes`) end of stream.
    pub async fn read(
        &self,
        limit: impl Into<ReadLimit>,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        self.check_flags(StreamFlags::READABLE | StreamFlags::SOCKET)?;
        match limit.into() {
            ReadLimit::Bytes(n) => maybe_timeout(timeout, self.recv_some(n, buf)).await,
            ReadLimit::All => maybe_timeout(timeout, self.recv_exact(usize::MAX, buf)).await,
        }
    }

    /// Suspends until exactly `n` bytes arrived. Returns nil on timeout or
    /// when the stream ends before the full count; bytes received before
    /// that stay in `buf`.
    pub async fn chunk(
        &self,
        n: usize,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        self.check_flags(StreamFlags::READABLE | StreamFlags::SOCKET)?;
        match maybe_timeout(timeout, self.recv_exact(n, buf)).await? {
            // End of stream short of the count behaves like a timeout.
            Some(total) if total < n => Ok(None),
            outcome => Ok(outcome),
        }
    }

    /// Suspends until all of `data` is written. Returns nil on timeout.
    pub async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<Option<()>> {
        self.check_flags(StreamFlags::WRITABLE | StreamFlags::SOCKET)?;
        maybe_timeout(timeout, self.send_all(data)).await
    }

    /// Suspends until one datagram arrives, appends up to `n` of its bytes
    /// to `buf` and returns the source address. Returns nil on timeout.
    pub async fn recv_from(
        &self,
        n: usize,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Option<SocketAddress>> {
        self.check_flags(StreamFlags::UDPSERVER | StreamFlags::SOCKET)?;
        maybe_timeout(timeout, self.recv_from_once(n, buf)).await
    }

    /// Suspends until `data` is written as one datagram to `dest`. Returns
    /// nil on timeout.
    pub async fn send_to(
        &self,
        dest: &SocketAddress,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<()>> {
        self.check_flags(StreamFlags::UDPSERVER | StreamFlags::SOCKET)?;
        maybe_timeout(timeout, self.send_to_once(dest, data)).await
    }

    async fn recv_some(&self, n: usize, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        let mut slice = vec![0u8; n.min(RECV_SLICE)];
        loop {
            match recv(self.fd(), &mut slice, MsgFlags::empty()) {
                // End of stream resumes with nil.
                Ok(0) => return Ok(None),
                Ok(count) => {
                    buf.extend_from_slice(&slice[..count]);
                    return Ok(Some(count));
                }
                Err(e) => match e.as_errno() {
                    Some(Errno::EAGAIN) => {
                        if let IoEvent::Closed = wait_io(self.fd(), Interest::Read).await? {
                            return Ok(None);
                        }
                    }
                    Some(Errno::EINTR) => continue,
                    _ => return Err(format_err!("could not read from stream: {}", e)),
                },
            }
        }
    }

    /// Receives until `n` bytes are in, stopping early at end of stream and
    /// reporting what arrived. With `n == usize::MAX` this is the
    /// read-everything mode; `chunk` layers its all-or-nil contract on top.
    async fn recv_exact(&self, n: usize, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        let mut remaining = n;
        let mut total = 0usize;
        let mut slice = vec![0u8; remaining.min(RECV_SLICE)];

        while remaining > 0 {
            let want = remaining.min(slice.len());
            match recv(self.fd(), &mut slice[..want], MsgFlags::empty()) {
                Ok(0) => break,
                Ok(count) => {
                    buf.extend_from_slice(&slice[..count]);
                    total += count;
                    remaining -= count;
                }
                Err(e) => match e.as_errno() {
                    Some(Errno::EAGAIN) => {
                        if let IoEvent::Closed = wait_io(self.fd(), Interest::Read).await? {
                            return Ok(None);
                        }
                    }
                    Some(Errno::EINTR) => continue,
                    _ => return Err(format_err!("could not read from stream: {}", e)),
                },
            }
        }

        Ok(Some(total))
    }

    async fn send_all(&self, data: &[u8]) -> Result<Option<()>> {
        let mut written = 0usize;
        while written < data.len() {
            match send(self.fd(), &data[written..], MsgFlags::MSG_NOSIGNAL) {
                Ok(count) => written += count,
                Err(e) => match e.as_errno() {
                    Some(Errno::EAGAIN) => {
                        if let IoEvent::Closed = wait_io(self.fd(), Interest::Write).await? {
                            return Ok(None);
                        }
                    }
                    Some(Errno::EINTR) => continue,
                    _ => return Err(format_err!("could not write to stream: {}", e)),
                },
            }
        }
        Ok(Some(()))
    }

    async fn recv_from_once(&self, n: usize, buf: &mut Vec<u8>) -> Result<Option<SocketAddress>> {
        let mut slice = vec![0u8; n.min(RECV_SLICE).max(1)];
        loop {
            eprintln!("DEBUG recvfrom fd={}", self.fd());
            match recvfrom::<nix::sys::socket::SockAddr>(self.fd(), &mut slice) {
                Ok((count, from)) => {
                    eprintln!("DEBUG recvfrom got count={} from={:?}", count, from);
                    buf.extend_from_slice(&slice[..count.min(n)]);
                    let from =
                        from.ok_or_else(|| err_msg("no source address on received datagram"))?;
                    return Ok(Some(SocketAddress(from)));
                }
                Err(e) => match e.as_errno() {
                    Some(Errno::EAGAIN) => {
                        if let IoEvent::Closed = wait_io(self.fd(), Interest::Read).await? {
                            return Ok(None);
                        }
                    }
                    Some(Errno::EINTR) => continue,
                    _ => return Err(format_err!("could not receive datagram: {}", e)),
                },
            }
        }
    }

    async fn send_to_once(&self, dest: &SocketAddress, data: &[u8]) -> Result<Option<()>> {
        loop {
            eprintln!("DEBUG sendto fd={} dest={:?}", self.fd(), dest.0);
            match sendto(self.fd(), data, &dest.0, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => { eprintln!("DEBUG sendto ok n={}", n); return Ok(Some(())) },
                Err(e) => match e.as_errno() {
                    Some(Errno::EAGAIN) => {
                        if let IoEvent::Closed = wait_io(self.fd(), Interest::Write).await? {
                            return Ok(None);
                        }
                    }
                    Some(Errno::EINTR) => continue,
                    _ => return Err(format_err!("could not send datagram: {}", e)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{address, SocketType};
    use crate::stream::{connect, listen};

    #[test]
    fn read_times_out_and_the_stream_survives() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let peer = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                // Quiet for longer than the read timeout, then speak up.
                executor::sleep(Duration::from_millis(300)).await;
                conn.write(b"hi", None).await.unwrap();
                executor::sleep(Duration::from_millis(300)).await;
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let mut buf = Vec::new();

            let first = client
                .read(16usize, &mut buf, Some(Duration::from_millis(30)))
                .await
                .unwrap();
            assert_eq!(first, None);

            // Same stream, second try succeeds.
            let second = client
                .read(16usize, &mut buf, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(second, Some(2));
            assert_eq!(buf, b"hi");

            peer.join().await;
        })
        .unwrap();
    }

    #[test]
    fn chunk_gets_exactly_n_across_partial_writes() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let peer = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                conn.write(b"he", None).await.unwrap();
                conn.flush().unwrap();
                executor::sleep(Duration::from_millis(40)).await;
                conn.write(b"llo", None).await.unwrap();
                executor::sleep(Duration::from_millis(100)).await;
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(client.chunk(5, &mut buf, None).await.unwrap(), Some(5));
            assert_eq!(buf, b"hello");

            peer.join().await;
        })
        .unwrap();
    }

    #[test]
    fn chunk_timeout_keeps_partial_bytes() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let peer = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                conn.write(b"hi", None).await.unwrap();
                executor::sleep(Duration::from_millis(400)).await;
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let mut buf = Vec::new();
            let got = client
                .chunk(5, &mut buf, Some(Duration::from_millis(60)))
                .await
                .unwrap();
            assert_eq!(got, None);
            assert_eq!(buf, b"hi");

            peer.join().await;
        })
        .unwrap();
    }

    #[test]
    fn chunk_returns_nil_when_the_stream_ends_short() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let peer = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                conn.write(b"hi", None).await.unwrap();
                // Dropping the stream closes it before the chunk completes.
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(client.chunk(5, &mut buf, None).await.unwrap(), None);
            assert_eq!(buf, b"hi");

            peer.join().await;
        })
        .unwrap();
    }

    #[test]
    fn read_all_drains_to_end_of_stream() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let peer = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                conn.write(b"all of it", None).await.unwrap();
                // Dropping the stream closes it; the reader sees EOF.
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let mut buf = Vec::new();
            let got = client.read(ReadLimit::All, &mut buf, None).await.unwrap();
            assert_eq!(got, Some(9));
            assert_eq!(buf, b"all of it");

            peer.join().await;
        })
        .unwrap();
    }

    #[test]
    fn datagram_round_trip() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Datagram)
                .await
                .unwrap();
            let server_port = server.localname().unwrap().port.unwrap();

            let client = listen("127.0.0.1", 0u16, SocketType::Datagram)
                .await
                .unwrap();
            let dest = address("127.0.0.1", server_port, SocketType::Datagram).unwrap();

            client.send_to(&dest, b"ping", None).await.unwrap();

            let mut buf = Vec::new();
            let from = server
                .recv_from(1024, &mut buf, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf, b"ping");

            // Reply to wherever the packet came from.
            server.send_to(&from, b"pong", None).await.unwrap();
            let mut reply = Vec::new();
            client.recv_from(1024, &mut reply, None).await.unwrap();
            assert_eq!(reply, b"pong");
        })
        .unwrap();
    }

    #[test]
    fn recv_from_times_out_with_nil() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Datagram)
                .await
                .unwrap();
            let mut buf = Vec::new();
            let got = server
                .recv_from(64, &mut buf, Some(Duration::from_millis(30)))
                .await
                .unwrap();
            assert!(got.is_none());
            assert!(buf.is_empty());
        })
        .unwrap();
    }

    #[test]
    fn writes_on_a_datagram_server_are_rejected() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Datagram)
                .await
                .unwrap();
            // A datagram server is not WRITABLE; send_to is the only way out.
            assert!(server.write(b"x", None).await.is_err());

            // Datagram operations on a plain duplex stream are rejected too.
            let tcp = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let dest = address("127.0.0.1", 9u16, SocketType::Datagram).unwrap();
            assert!(tcp.send_to(&dest, b"x", None).await.is_err());
        })
        .unwrap();
    }
}
