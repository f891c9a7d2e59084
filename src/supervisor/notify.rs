//! Lifecycle notifications to the supervisor of this process.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// A message to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Ready,
    Stopping,
    ExtendTimeout(Duration),
    Status(String),
}

impl Notification {
    /// Wire form of the notification.
    pub fn message(&self) -> String {
        match self {
            Notification::Ready => "READY=1".to_string(),
            Notification::Stopping => "STOPPING=1".to_string(),
            Notification::ExtendTimeout(d) => format!("EXTEND_TIMEOUT_USEC={}", d.as_micros()),
            Notification::Status(s) => format!("STATUS={}", s.replace('\n', " ")),
        }
    }
}

/// Best-effort notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sends notifications over the datagram socket named by `NOTIFY_SOCKET`.
///
/// Without a socket every notification is dropped, which is what a process
/// started outside the supervisor wants.
#[derive(Debug, Clone, Default)]
pub struct SdNotifier {
    socket: Option<PathBuf>,
}

impl SdNotifier {
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from),
        }
    }

    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn send(&self, message: &str) -> std::io::Result<()> {
        let Some(path) = &self.socket else {
            return Ok(());
        };
        let sock = UnixDatagram::unbound()?;
        let raw = path.as_os_str().as_encoded_bytes();
        if let Some(name) = raw.strip_prefix(b"@") {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            sock.send_to_addr(message.as_bytes(), &addr)?;
        } else {
            sock.send_to(message.as_bytes(), path)?;
        }
        Ok(())
    }
}

impl Notifier for SdNotifier {
    fn notify(&self, notification: Notification) {
        let message = notification.message();
        match self.send(&message) {
            Ok(()) => tracing::debug!(message = %message, "Supervisor notified"),
            Err(e) => tracing::warn!(message = %message, error = %e, "Supervisor notification failed"),
        }
    }
}

/// Keeps every notification for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        let mut sent = match self.sent.lock() {
            Ok(sent) => sent,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        assert_eq!(Notification::Ready.message(), "READY=1");
        assert_eq!(
            Notification::ExtendTimeout(Duration::from_secs(60)).message(),
            "EXTEND_TIMEOUT_USEC=60000000"
        );
        assert_eq!(Notification::Status("a\nb".into()).message(), "STATUS=a b");
    }

    #[test]
    fn sends_datagrams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        SdNotifier::with_socket(&path).notify(Notification::Stopping);
        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1");
    }

    #[test]
    fn missing_socket_is_silent() {
        SdNotifier::default().notify(Notification::Ready);
        SdNotifier::with_socket("/nonexistent/notify.sock").notify(Notification::Ready);
    }
}
