mod address;
mod io;
mod stream;

pub use address::{
    address, addresses, Port, SocketAddress, SocketName, SocketType, SOCKET_ADDRESS_TYPE,
};
pub use io::ReadLimit;
pub use stream::{connect, listen, ShutdownMode, Stream, StreamFlags, STREAM_TYPE};
