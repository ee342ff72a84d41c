//! Listening socket shared by sibling worker processes.
//!
//! On unix every worker binds its own socket with `SO_REUSEPORT` and the
//! kernel spreads incoming connections across them. Elsewhere the bind is
//! plain and only one worker can own the port.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use super::ServerError;

/// Pending connection queue length.
const LISTEN_BACKLOG: i32 = 1024;

fn bind_error(addr: SocketAddr, source: std::io::Error) -> ServerError {
    ServerError::Bind {
        address: addr.to_string(),
        source,
    }
}

/// How a worker acquires its listening port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindMode {
    /// The port belongs to this process alone; an occupied port is an error.
    #[default]
    Exclusive,
    /// Sibling workers of one supervisor bind the same port.
    Shared,
}

/// Bind `addr` according to `mode`.
///
/// # Errors
///
/// Returns `ServerError::Bind` if the port cannot be acquired.
pub async fn bind_listener(addr: SocketAddr, mode: BindMode) -> Result<TcpListener, ServerError> {
    match mode {
        BindMode::Exclusive => TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(addr, e)),
        BindMode::Shared => bind_shared(addr),
    }
}

/// Bind `addr` so that other processes may bind the same port.
///
/// # Errors
///
/// Returns `ServerError::Bind` if the socket cannot be created or bound.
#[cfg(unix)]
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
        SockaddrStorage,
    };

    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };

    #[cfg(not(target_vendor = "apple"))]
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(|e| bind_error(addr, e.into()))?;

    // No SOCK_CLOEXEC on Apple targets.
    #[cfg(target_vendor = "apple")]
    let fd = {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let fd = socket(family, SockType::Stream, SockFlag::empty(), None)
            .map_err(|e| bind_error(addr, e.into()))?;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| bind_error(addr, e.into()))?;
        fd
    };

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| bind_error(addr, e.into()))?;
    setsockopt(&fd, sockopt::ReusePort, &true).map_err(|e| bind_error(addr, e.into()))?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).map_err(|e| bind_error(addr, e.into()))?;
    let backlog = Backlog::new(LISTEN_BACKLOG).map_err(|e| bind_error(addr, e.into()))?;
    listen(&fd, backlog).map_err(|e| bind_error(addr, e.into()))?;

    let listener = std::net::TcpListener::from(fd);
    listener
        .set_nonblocking(true)
        .map_err(|e| bind_error(addr, e))?;
    TcpListener::from_std(listener).map_err(|e| bind_error(addr, e))
}

/// Bind `addr` for a single process.
///
/// # Errors
///
/// Returns `ServerError::Bind` if the socket cannot be bound.
#[cfg(not(unix))]
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = std::net::TcpListener::bind(addr).map_err(|e| bind_error(addr, e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| bind_error(addr, e))?;
    TcpListener::from_std(listener).map_err(|e| bind_error(addr, e))
}

/// Resolve `host:port` to the first matching socket address.
///
/// # Errors
///
/// Returns `ServerError::InvalidAddress` if nothing resolves.
pub async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let invalid = || ServerError::InvalidAddress(format!("{host}:{port}"));
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}
