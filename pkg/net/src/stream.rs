use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use base_error::*;
use bitflags::bitflags;
use executor::{wait_io, Interest, IoEvent};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept4, bind, connect as sock_connect, getpeername, getsockname, listen as sock_listen,
    setsockopt, socket, sockopt, Shutdown, SockFlag, SockType,
};
use value::{AbstractType, Value};

use crate::address::{resolve, socket_name, Port, SocketAddress, SocketName, SocketType};

const CONNECTION_BACKLOG: usize = 1024;

pub static STREAM_TYPE: AbstractType = AbstractType {
    name: "core/stream",
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        const READABLE   = 1 << 0;
        const WRITABLE   = 1 << 1;
        /// Server stream produced by a stream-type listen.
        const ACCEPTABLE = 1 << 2;
        /// Server stream produced by a datagram-type listen.
        const UDPSERVER  = 1 << 3;
        const SOCKET     = 1 << 4;
        const CLOSED     = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Both,
    Read,
    Write,
}

impl Default for ShutdownMode {
    fn default() -> Self {
        ShutdownMode::Both
    }
}

/// A non-blocking socket owned by the runtime. At most one suspended
/// operation may be pending per direction; closing delivers nil to all of
/// them and releases the descriptor.
pub struct Stream {
    fd: RawFd,
    flags: Cell<StreamFlags>,
}

impl Stream {
    pub(crate) fn new(fd: RawFd, flags: StreamFlags) -> Self {
        set_nosigpipe(fd);
        Self {
            fd,
            flags: Cell::new(flags | StreamFlags::SOCKET),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags.get()
    }

    pub fn is_closed(&self) -> bool {
        self.flags.get().contains(StreamFlags::CLOSED)
    }

    pub(crate) fn check_flags(&self, required: StreamFlags) -> Result<()> {
        let flags = self.flags.get();
        if flags.contains(StreamFlags::CLOSED) {
            return Err(err_msg("stream is closed"));
        }
        if !flags.contains(required) {
            return Err(format_err!(
                "stream does not support this operation (has {:?}, needs {:?})",
                flags,
                required
            ));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(err_msg("stream is closed"));
        }
        Ok(())
    }

    /// Closes the stream: every fiber suspended on it resumes with nil, the
    /// descriptor leaves the event loop and is released. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.flags.set(self.flags.get() | StreamFlags::CLOSED);
        executor::close_io(self.fd);
        let _ = nix::unistd::close(self.fd);
        debug!("closed stream fd {}", self.fd);
    }

    /// Half-closes the stream without releasing it. Restarted on EINTR.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        self.check_open()?;
        let how = match mode {
            ShutdownMode::Both => Shutdown::Both,
            ShutdownMode::Read => Shutdown::Read,
            ShutdownMode::Write => Shutdown::Write,
        };
        loop {
            match nix::sys::socket::shutdown(self.fd, how) {
                Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
                Err(e) => return Err(format_err!("could not shutdown socket: {}", e)),
                Ok(()) => return Ok(()),
            }
        }
    }

    /// Kernel-level push: toggles TCP_NODELAY on and off so buffered data
    /// leaves now. The I/O model is unbuffered, so there is nothing to flush
    /// in userspace.
    pub fn flush(&self) -> Result<()> {
        self.check_flags(StreamFlags::WRITABLE | StreamFlags::SOCKET)?;
        let _ = setsockopt(self.fd, sockopt::TcpNoDelay, &true);
        let _ = setsockopt(self.fd, sockopt::TcpNoDelay, &false);
        Ok(())
    }

    pub fn localname(&self) -> Result<SocketName> {
        self.check_open()?;
        let addr = getsockname(self.fd)
            .map_err(|e| format_err!("failed to get local name of fd {}: {}", self.fd, e))?;
        Ok(socket_name(&addr))
    }

    pub fn peername(&self) -> Result<SocketName> {
        self.check_open()?;
        let addr = getpeername(self.fd)
            .map_err(|e| format_err!("failed to get peer name of fd {}: {}", self.fd, e))?;
        Ok(socket_name(&addr))
    }

    /// Suspends until a connection arrives and returns it as a new duplex
    /// stream, or nil when the timeout elapses or the server stream closes.
    pub async fn accept(&self, timeout: Option<std::time::Duration>) -> Result<Option<Stream>> {
        self.check_flags(StreamFlags::ACCEPTABLE | StreamFlags::SOCKET)?;
        crate::io::maybe_timeout(timeout, self.accept_one()).await
    }

    async fn accept_one(&self) -> Result<Option<Stream>> {
        loop {
            match accept4(self.fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                Ok(fd) => {
                    debug!("accepted connection fd {} on server fd {}", fd, self.fd);
                    return Ok(Some(Stream::new(
                        fd,
                        StreamFlags::READABLE | StreamFlags::WRITABLE,
                    )));
                }
                Err(e) => match e.as_errno() {
                    Some(Errno::EINTR) | Some(Errno::ECONNABORTED) => continue,
                    errno => {
                        // A failed accept never tears the listener down:
                        // stay registered and retry on the next readiness
                        // event. Only close ends the wait.
                        if errno != Some(Errno::EAGAIN) {
                            debug!("accept on fd {} failed, retrying: {}", self.fd, e);
                        }
                        if let IoEvent::Closed = wait_io(self.fd, Interest::Read).await? {
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }

    /// Runs a server: every accepted connection is handed to `handler` on a
    /// fresh supervised fiber (inheriting this fiber's supervisor channel).
    /// Suspends until the server stream closes, which resumes it exactly
    /// once with nil; a handler error goes to the supervisor, not here.
    pub async fn accept_loop<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Stream) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.check_flags(StreamFlags::ACCEPTABLE | StreamFlags::SOCKET)?;
        loop {
            match accept4(self.fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                Ok(fd) => {
                    debug!("accepted connection fd {} on server fd {}", fd, self.fd);
                    let stream =
                        Stream::new(fd, StreamFlags::READABLE | StreamFlags::WRITABLE);
                    executor::spawn_supervised(handler(stream));
                }
                Err(e) => match e.as_errno() {
                    Some(Errno::EINTR) | Some(Errno::ECONNABORTED) => continue,
                    errno => {
                        // The loop outlives any failed accept; it stays
                        // registered until the server stream closes.
                        if errno != Some(Errno::EAGAIN) {
                            debug!("accept on fd {} failed, retrying: {}", self.fd, e);
                        }
                        if let IoEvent::Closed = wait_io(self.fd, Interest::Read).await? {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    pub fn into_value(self) -> Value {
        Value::abstract_of(&STREAM_TYPE, Rc::new(self))
    }

    pub fn from_value(v: &Value) -> Result<Rc<Stream>> {
        match v {
            Value::Abstract(a) if a.is_type(&STREAM_TYPE) => a
                .downcast::<Stream>()
                .ok_or_else(|| err_msg("corrupt stream value")),
            _ => Err(err_msg("expected a core/stream")),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream(fd: {}, flags: {:?})", self.fd, self.flags.get())
    }
}

/// Opens a client connection. Resolved addresses are tried in order; the
/// socket of the first successful connect is made non-blocking and wrapped
/// as a duplex stream.
pub async fn connect(host: &str, port: impl Into<Port>, ty: SocketType) -> Result<Stream> {
    let addrs = resolve(host, &port.into().render(), ty, false)?;

    let mut last_error = None;
    for addr in &addrs {
        let fd = match socket(
            addr.0.family(),
            sock_type(ty),
            SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                last_error = Some(format_err!("could not create socket: {}", e));
                continue;
            }
        };

        match sock_connect(fd, &addr.0) {
            Ok(()) => {
                set_nonblocking(fd)?;
                debug!("connected fd {} to {}", fd, addr);
                return Ok(Stream::new(
                    fd,
                    StreamFlags::READABLE | StreamFlags::WRITABLE,
                ));
            }
            Err(e) => {
                let _ = nix::unistd::close(fd);
                last_error = Some(format_err!("could not connect to socket: {}", e));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| err_msg("no data for given address")))
}

/// Creates a server stream. Stream sockets come back `ACCEPTABLE` with a
/// listen backlog; datagram sockets come back `UDPSERVER` and readable.
pub async fn listen(host: &str, port: impl Into<Port>, ty: SocketType) -> Result<Stream> {
    let addrs = resolve(host, &port.into().render(), ty, true)?;

    let mut bound = None;
    let mut last_error = None;
    for addr in &addrs {
        let fd = match socket(
            addr.0.family(),
            sock_type(ty),
            SockFlag::SOCK_CLOEXEC,
            None,
        ) {
            Ok(fd) => fd,
            Err(e) => {
                last_error = Some(format_err!("could not create socket: {}", e));
                continue;
            }
        };

        if let Err(e) = serverify_socket(fd) {
            let _ = nix::unistd::close(fd);
            last_error = Some(e);
            continue;
        }

        match bind(fd, &addr.0) {
            Ok(()) => {
                bound = Some(fd);
                break;
            }
            Err(e) => {
                let _ = nix::unistd::close(fd);
                last_error = Some(format_err!("could not bind socket: {}", e));
            }
        }
    }

    let fd = match bound {
        Some(fd) => fd,
        None => {
            return Err(last_error.unwrap_or_else(|| err_msg("could not bind to any sockets")))
        }
    };

    if ty == SocketType::Datagram {
        debug!("datagram server on fd {}", fd);
        return Ok(Stream::new(
            fd,
            StreamFlags::UDPSERVER | StreamFlags::READABLE,
        ));
    }

    if let Err(e) = sock_listen(fd, CONNECTION_BACKLOG) {
        let _ = nix::unistd::close(fd);
        return Err(format_err!("could not listen on file descriptor: {}", e));
    }
    debug!("stream server on fd {}", fd);
    Ok(Stream::new(fd, StreamFlags::ACCEPTABLE))
}

fn sock_type(ty: SocketType) -> SockType {
    match ty {
        SocketType::Stream => SockType::Stream,
        SocketType::Datagram => SockType::Datagram,
    }
}

/// Server socket options: address reuse plus non-blocking mode.
fn serverify_socket(fd: RawFd) -> Result<()> {
    setsockopt(fd, sockopt::ReuseAddr, &true)
        .map_err(|e| format_err!("setsockopt(SO_REUSEADDR) failed: {}", e))?;
    setsockopt(fd, sockopt::ReusePort, &true)
        .map_err(|e| format_err!("setsockopt(SO_REUSEPORT) failed: {}", e))?;
    set_nonblocking(fd)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_nosigpipe(fd: RawFd) {
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
fn set_nosigpipe(_fd: RawFd) {
    // Linux suppresses SIGPIPE per send call with MSG_NOSIGNAL instead.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn listen_reports_its_local_name() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let name = server.localname().unwrap();
            assert_eq!(name.host, "127.0.0.1");
            assert!(name.port.unwrap() > 0);
        })
        .unwrap();
    }

    #[test]
    fn echo_through_accept() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let server_fiber = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                let mut buf = Vec::new();
                let n = conn.read(5usize, &mut buf, None).await.unwrap().unwrap();
                conn.write(&buf[..n], None).await.unwrap();
                conn.flush().unwrap();
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            client.write(b"hello", None).await.unwrap();

            let mut buf = Vec::new();
            assert_eq!(client.chunk(5, &mut buf, None).await.unwrap(), Some(5));
            assert_eq!(buf, b"hello");

            server_fiber.join().await;
        })
        .unwrap();
    }

    #[test]
    fn peername_matches_the_server() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let acceptor = executor::spawn(async move {
                let _conn = server.accept(None).await.unwrap().unwrap();
                executor::sleep(Duration::from_millis(50)).await;
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let peer = client.peername().unwrap();
            assert_eq!(peer.host, "127.0.0.1");
            assert_eq!(peer.port, Some(port));

            acceptor.join().await;
        })
        .unwrap();
    }

    #[test]
    fn accept_times_out_with_nil() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let got = server
                .accept(Some(Duration::from_millis(30)))
                .await
                .unwrap();
            assert!(got.is_none());
            // The server stream is still usable afterwards.
            assert!(server.localname().is_ok());
        })
        .unwrap();
    }

    #[test]
    fn accept_loop_serves_until_closed() {
        executor::run(async {
            let server = Rc::new(listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap());
            let port = server.localname().unwrap().port.unwrap();

            let loop_server = server.clone();
            let loop_fiber = executor::spawn(async move {
                loop_server
                    .accept_loop(|conn| async move {
                        let mut buf = Vec::new();
                        while let Some(n) = conn.read(1024usize, &mut buf, None).await? {
                            conn.write(&buf[..n], None).await?;
                            buf.clear();
                        }
                        Ok(())
                    })
                    .await
            });

            for _ in 0..2 {
                let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
                client.write(b"ping", None).await.unwrap();
                let mut buf = Vec::new();
                assert_eq!(client.chunk(4, &mut buf, None).await.unwrap(), Some(4));
                assert_eq!(buf, b"ping");
            }

            // Closing the server wakes the loop exactly once, with nil.
            server.close();
            assert!(loop_fiber.join().await.is_ok());
        })
        .unwrap();
    }

    #[test]
    fn handler_errors_go_to_the_supervisor() {
        executor::run(async {
            let (sup_tx, sup_rx) = executor::supervisor_channel(8);
            let server = Rc::new(listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap());
            let port = server.localname().unwrap().port.unwrap();

            let loop_server = server.clone();
            executor::spawn_with_supervisor(
                async move {
                    loop_server
                        .accept_loop(|_conn| async move { Err(err_msg("handler failed")) })
                        .await
                },
                sup_tx,
            );

            let _client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let outcome = sup_rx.recv().await.unwrap();
            assert!(outcome.result.is_err());

            // The loop keeps accepting after a handler failure.
            let _client2 = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            let outcome = sup_rx.recv().await.unwrap();
            assert!(outcome.result.is_err());

            server.close();
        })
        .unwrap();
    }

    #[test]
    fn shutdown_write_is_a_half_close() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let port = server.localname().unwrap().port.unwrap();

            let acceptor = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                // Peer half-closed: reads see end of stream.
                let mut buf = Vec::new();
                assert_eq!(conn.read(8usize, &mut buf, None).await.unwrap(), None);
                // The other direction still flows.
                conn.write(b"ok", None).await.unwrap();
                // Hold the stream until the peer has read the reply.
                executor::sleep(Duration::from_millis(100)).await;
            });

            let client = connect("127.0.0.1", port, SocketType::Stream).await.unwrap();
            client.shutdown(ShutdownMode::Write).unwrap();

            // Writing after a write shutdown raises.
            assert!(client.write(b"x", None).await.is_err());

            // Reading still works until the peer closes.
            let mut buf = Vec::new();
            assert_eq!(client.chunk(2, &mut buf, None).await.unwrap(), Some(2));
            assert_eq!(buf, b"ok");

            acceptor.join().await;
        })
        .unwrap();
    }

    #[test]
    fn closed_streams_reject_operations() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            server.close();
            assert!(server.accept(None).await.is_err());
            assert!(server.localname().is_err());
            // Closing again is a no-op.
            server.close();
        })
        .unwrap();
    }

    #[test]
    fn unix_stream_round_trip() {
        executor::run(async {
            let dir = std::env::temp_dir().join(format!("net-test-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join("echo.sock");
            let path = path.to_str().unwrap().to_string();

            let server = listen(":unix", path.as_str(), SocketType::Stream)
                .await
                .unwrap();
            assert_eq!(server.localname().unwrap().host, path);

            let srv = executor::spawn(async move {
                let conn = server.accept(None).await.unwrap().unwrap();
                let mut buf = Vec::new();
                let n = conn.read(3usize, &mut buf, None).await.unwrap().unwrap();
                conn.write(&buf[..n], None).await.unwrap();
            });

            let client = connect(":unix", path.as_str(), SocketType::Stream)
                .await
                .unwrap();
            client.write(b"abc", None).await.unwrap();
            let mut buf = Vec::new();
            assert_eq!(client.chunk(3, &mut buf, None).await.unwrap(), Some(3));

            srv.join().await;
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_dir(&dir);
        })
        .unwrap();
    }

    #[test]
    fn stream_value_round_trip() {
        executor::run(async {
            let server = listen("127.0.0.1", 0u16, SocketType::Stream).await.unwrap();
            let v = server.into_value();
            let stream = Stream::from_value(&v).unwrap();
            assert!(stream.flags().contains(StreamFlags::ACCEPTABLE));
            assert!(Stream::from_value(&Value::Integer(1)).is_err());
        })
        .unwrap();
    }
}
