extern crate base_error;
extern crate executor;
extern crate net;

use std::rc::Rc;

use base_error::*;
use log::info;
use net::SocketType;

// Serves a line-less echo on 127.0.0.1:7777 until killed.
fn main() -> Result<()> {
    env_logger::init();

    executor::run(async {
        let server = Rc::new(net::listen("127.0.0.1", 7777u16, SocketType::Stream).await?);
        info!("echo server listening on {}", server.localname()?);

        server
            .accept_loop(|stream| async move {
                let mut buf = Vec::new();
                while let Some(count) = stream.read(4096usize, &mut buf, None).await? {
                    stream.write(&buf[..count], None).await?;
                    buf.clear();
                }
                Ok(())
            })
            .await
    })?
}
