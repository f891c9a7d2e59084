//! Listeners: bound addresses or sockets passed by the supervisor.
//!
//! Socket activation follows the `LISTEN_PID`/`LISTEN_FDS` protocol; the
//! first passed descriptor is fd 3.

use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

const LISTEN_FDS_START: RawFd = 3;

/// An accepted stream of either listener family.
pub enum Accepted {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// A TCP or Unix stream listener.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, Option<PathBuf>),
}

impl Listener {
    /// Bind `addr`: `unix:<path>` or `<host>:<port>`.
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        if let Some(path) = addr.strip_prefix("unix:") {
            let path = PathBuf::from(path);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let listener = UnixListener::bind(&path)?;
            return Ok(Listener::Unix(listener, Some(path)));
        }
        Ok(Listener::Tcp(TcpListener::bind(addr).await?))
    }

    /// The first socket passed by the supervisor, if any was passed to this
    /// process. The activation variables are cleared so children do not
    /// inherit them.
    pub fn from_activation() -> std::io::Result<Option<Self>> {
        let pid_matches = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map(|pid| pid == std::process::id())
            .unwrap_or(false);
        let fds = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FDNAMES");

        if !pid_matches || fds == 0 {
            return Ok(None);
        }
        if fds > 1 {
            tracing::warn!(fds, "Only the first activated socket is used");
        }
        Self::from_fd(LISTEN_FDS_START).map(Some)
    }

    fn from_fd(fd: RawFd) -> std::io::Result<Self> {
        let family = socket_family(fd)?;
        if family == libc::AF_UNIX {
            // SAFETY: fd was passed to us by the supervisor and is owned from here on.
            let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
            std_listener.set_nonblocking(true)?;
            Ok(Listener::Unix(UnixListener::from_std(std_listener)?, None))
        } else {
            // SAFETY: as above.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            std_listener.set_nonblocking(true)?;
            Ok(Listener::Tcp(TcpListener::from_std(std_listener)?))
        }
    }

    pub async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Listener::Tcp(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
            Listener::Unix(l, _) => l.accept().await.map(|(s, _)| Accepted::Unix(s)),
        }
    }

    /// Human readable address for logs.
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix(_, Some(path)) => format!("unix:{}", path.display()),
            Listener::Unix(_, None) => "unix:<activated>".to_string(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, Some(path)) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn socket_family(fd: RawFd) -> std::io::Result<libc::c_int> {
    // SAFETY: zeroed sockaddr_storage is a valid out-parameter for getsockname.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage and len are valid for writes of the declared size.
    let rc = unsafe {
        libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(libc::c_int::from(storage.ss_family))
}
