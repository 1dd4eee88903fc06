use std::net::{SocketAddr as StdSocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;

use tokio::io;
use tokio::net::{TcpListener, TcpSocket, UnixListener};

use crate::net::stream::{Stream, StreamType};
use crate::net::sys::{apply_tcp_keepalive, TcpKeepAliveConfig};

const LISTENER_BACKLOG: u32 = 65535;

/// a bound accept socket
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn accept_stream(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (tcp, peer) = listener.accept().await?;
                if let Err(e) = apply_tcp_keepalive(tcp.as_raw_fd(), &TcpKeepAliveConfig::default())
                {
                    tracing::debug!(error = %e, "failed to arm tcp keepalive");
                }
                let mut stream = StreamType::from(tcp);
                stream.set_no_delay();
                Ok((Box::new(stream) as Stream, peer.to_string()))
            }
            Listener::Unix(listener) => {
                let (unix, _) = listener.accept().await?;
                let stream = StreamType::from(unix);
                Ok((Box::new(stream) as Stream, "uds".to_string()))
            }
        }
    }
}

/// where a service listens
#[derive(Clone, Debug)]
pub enum ListenerAddress {
    Tcp(String),
    Unix(String),
}

impl ListenerAddress {
    pub fn bind(&self) -> io::Result<Listener> {
        match self {
            ListenerAddress::Tcp(address) => {
                let socket_address = address
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "could not resolve address")
                    })?;
                let socket = match socket_address {
                    StdSocketAddr::V4(_) => TcpSocket::new_v4()?,
                    StdSocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(socket_address)?;
                socket.listen(LISTENER_BACKLOG).map(Listener::Tcp)
            }
            ListenerAddress::Unix(path) => {
                // a stale socket file blocks the bind
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                // rebuild through socket2 to widen the accept backlog
                let socket: socket2::Socket = listener.into_std()?.into();
                socket.listen(LISTENER_BACKLOG as i32)?;
                socket.set_nonblocking(true)?;
                UnixListener::from_std(socket.into()).map(Listener::Unix)
            }
        }
    }
}
