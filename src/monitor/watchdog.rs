//! Probes the tunnel on a timer and replaces it once it stops answering.

use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::Settings;
use crate::tunnel::{EstablishError, Liveness, SessionLauncher, Supervisor, TunnelSession};

/// Verdict of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Prompt came back; the tunnel is responsive.
    Healthy,
    /// Probe timed out; carries the consecutive-failure count so far.
    Suspect(u32),
    /// Consecutive failures exceeded the threshold; replace the tunnel.
    Replace,
}

/// Watches one tunnel session. This is the daemon's main loop after
/// startup; it only ends if a replacement attempt hits a fatal error.
pub struct Watchdog {
    probe_interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
    failures: u32,
}

impl Watchdog {
    pub fn new(settings: &Settings) -> Self {
        Self {
            probe_interval: settings.probe_interval(),
            probe_timeout: settings.probe_timeout(),
            failure_threshold: settings.failure_threshold,
            failures: 0,
        }
    }

    /// Consecutive probe failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Run one probe against the session and update the failure counter.
    pub fn observe(&mut self, session: &mut TunnelSession) -> ProbeVerdict {
        if session.probe(self.probe_timeout) {
            self.failures = 0;
            session.set_liveness(Liveness::Healthy);
            return ProbeVerdict::Healthy;
        }

        self.failures += 1;
        warn!("Tunnel probe timed out (count = {})", self.failures);
        if self.failures > self.failure_threshold {
            session.set_liveness(Liveness::Dead);
            ProbeVerdict::Replace
        } else {
            session.set_liveness(Liveness::Suspect);
            ProbeVerdict::Suspect(self.failures)
        }
    }

    /// One monitor iteration: probe, and replace the session if it is dead.
    ///
    /// The dead session is shut down before a replacement is established,
    /// so the local SOCKS port is never bound twice.
    pub fn step<L: SessionLauncher>(
        &mut self,
        mut session: TunnelSession,
        supervisor: &Supervisor<L>,
    ) -> Result<TunnelSession, EstablishError> {
        match self.observe(&mut session) {
            ProbeVerdict::Replace => {
                error!("Tunnel unresponsive; shutting it down and reconnecting");
                session.shutdown();
                let replacement = supervisor.establish()?;
                self.failures = 0;
                Ok(replacement)
            }
            _ => Ok(session),
        }
    }

    /// Probe forever, replacing the tunnel whenever it goes unresponsive.
    pub fn run<L: SessionLauncher>(
        mut self,
        mut session: TunnelSession,
        supervisor: &Supervisor<L>,
    ) -> Result<(), EstablishError> {
        loop {
            thread::sleep(self.probe_interval);
            session = self.step(session, supervisor)?;
        }
    }
}
