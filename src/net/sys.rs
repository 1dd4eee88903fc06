use std::io::{self, Error};
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};

// setsockopt wrapper
fn set_socket_option<T: Copy>(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    value: &T,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if result == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// tcp keep-alive probing knobs
#[derive(Clone, Debug)]
pub struct TcpKeepAliveConfig {
    /// idle time before probing starts
    pub idle: Duration,
    /// seconds between probes
    pub interval: Duration,
    /// probes to send before giving up on the peer
    pub count: usize,
}

impl Default for TcpKeepAliveConfig {
    fn default() -> Self {
        TcpKeepAliveConfig {
            idle: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            count: 5,
        }
    }
}

pub fn apply_tcp_keepalive(fd: RawFd, config: &TcpKeepAliveConfig) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &1i32)?;
    set_socket_option(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPIDLE,
        &(config.idle.as_secs() as c_int),
    )?;
    set_socket_option(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPINTVL,
        &(config.interval.as_secs() as c_int),
    )?;
    set_socket_option(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPCNT,
        &(config.count as c_int),
    )
}
