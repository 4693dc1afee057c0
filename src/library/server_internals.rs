use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{io, net::SocketAddr, net::TcpListener};
use tracing::trace;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_BACKLOG: i32 = 3;

pub trait ServerInternal {
    /// Plain blocking IPv4 listener; the ring does the waiting for us.
    fn build_listener(&self, addr: &str, backlog: i32) -> io::Result<TcpListener> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("{addr}: {err}")))?;
        if !addr.is_ipv4() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "only IPv4 listeners are supported"));
        }
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.listen(backlog)?;
        trace!("Listening on {addr} (backlog {backlog})");
        Ok(listener.into())
    }
}
