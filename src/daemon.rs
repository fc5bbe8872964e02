//! Startup wiring: profile, first tunnel, readiness, then the watchdog loop.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{Profile, Settings};
use crate::monitor::Watchdog;
use crate::notify;
use crate::tunnel::{SshLauncher, Supervisor};

/// Run the daemon. Returns only on a fatal error: a broken profile store,
/// an unverified host key, or an unlaunchable ssh client.
pub fn run(settings: Settings) -> Result<()> {
    // Configuration errors are fatal before anything is spawned.
    let store = settings.store_path();
    let profile = Profile::load(&store)
        .with_context(|| format!("failed to load profile store {}", store.display()))?;
    info!("Using profile for {}@{}", profile.user, profile.host);

    let launcher = SshLauncher::new(profile.clone(), settings.local_port);
    let supervisor = Supervisor::new(launcher, profile, &settings);

    let session = supervisor.establish()?;

    // Tell the service manager we are serving. Exactly once, best-effort.
    notify::from_env().notify_ready();

    Watchdog::new(&settings).run(session, &supervisor)?;
    Ok(())
}
