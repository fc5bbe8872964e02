//! Service-manager readiness notification.
//!
//! When the daemon runs under a supervisor that set `$NOTIFY_SOCKET`
//! (systemd with `Type=notify`), a single `READY=1` datagram is sent after
//! the first tunnel comes up. Anywhere else this is a no-op. Delivery is
//! best-effort by contract: a missing or broken socket must never take the
//! daemon down.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use tracing::debug;

/// Signals the process supervisor that startup is complete.
pub trait ReadinessNotifier {
    /// Deliver the readiness signal. Best-effort; never fails the caller.
    fn notify_ready(&self);
}

/// Speaks the sd_notify datagram protocol over `$NOTIFY_SOCKET`.
pub struct SystemdNotifier {
    socket_path: String,
}

/// Used when no supervisor integration is configured.
pub struct NoopNotifier;

impl ReadinessNotifier for NoopNotifier {
    fn notify_ready(&self) {}
}

impl ReadinessNotifier for SystemdNotifier {
    fn notify_ready(&self) {
        if let Err(err) = self.send("READY=1") {
            debug!("Readiness notification not delivered: {err}");
        }
    }
}

impl SystemdNotifier {
    fn send(&self, state: &str) -> std::io::Result<()> {
        let socket = UnixDatagram::unbound()?;
        // A leading '@' names a socket in the abstract namespace.
        if let Some(name) = self.socket_path.strip_prefix('@') {
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            socket.send_to_addr(state.as_bytes(), &addr)?;
        } else {
            socket.send_to(state.as_bytes(), &self.socket_path)?;
        }
        Ok(())
    }
}

/// Pick the notifier the environment calls for.
pub fn from_env() -> Box<dyn ReadinessNotifier> {
    match std::env::var("NOTIFY_SOCKET") {
        Ok(path) if !path.is_empty() => Box::new(SystemdNotifier { socket_path: path }),
        _ => Box::new(NoopNotifier),
    }
}
