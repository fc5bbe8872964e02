//! Tunnel establishment and session lifecycle.

mod supervisor;

pub use supervisor::{EstablishError, SessionLauncher, SshLauncher, Supervisor};

use std::time::Duration;

use regex::Regex;

use crate::pty::{ExpectOutcome, PtySession};

/// Liveness of the current tunnel as judged by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Suspect,
    Dead,
}

/// One live tunnel: an authenticated interactive shell over ssh with the
/// SOCKS listener bound on the local side.
///
/// At most one of these exists at a time. The supervisor creates it, the
/// watchdog owns it afterwards; dropping it terminates the ssh child and
/// with it the SOCKS binding.
pub struct TunnelSession {
    pty: PtySession,
    prompt: Regex,
    liveness: Liveness,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("prompt", &self.prompt)
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    pub(crate) fn new(pty: PtySession, prompt: Regex) -> Self {
        Self {
            pty,
            prompt,
            liveness: Liveness::Healthy,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub(crate) fn set_liveness(&mut self, liveness: Liveness) {
        self.liveness = liveness;
    }

    /// Send a no-op line and wait for the shell prompt to come back.
    pub fn probe(&mut self, timeout: Duration) -> bool {
        if self.pty.send_line("").is_err() {
            return false;
        }
        let prompt = &self.prompt;
        matches!(
            self.pty.expect_any(&[prompt], timeout),
            ExpectOutcome::Matched { .. }
        )
    }

    /// Tear the session down, terminating the ssh child and freeing the
    /// local SOCKS port.
    pub fn shutdown(self) {
        // PtySession::drop terminates and reaps the child.
        drop(self);
    }
}
