//! Spawns the ssh client and drives it to an authenticated tunnel,
//! classifying everything the connect phase can throw at it.

use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use portable_pty::CommandBuilder;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use super::TunnelSession;
use crate::config::{Profile, Settings};
use crate::pty::{ExpectOutcome, PtySession};

static PASSWORD_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Pp]assword:").expect("invalid PASSWORD_PROMPT regex"));

// Also matches the newer "(yes/no/[fingerprint])" wording.
static HOST_KEY_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(yes/no(?:/\[fingerprint\])?\)").expect("invalid HOST_KEY_PROMPT regex")
});

static NETWORK_UNREACHABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new("Network is unreachable").expect("invalid NETWORK_UNREACHABLE regex"));

/// Fatal establishment failures. Transient ones never get out of
/// [`Supervisor::establish`]; they are retried there.
#[derive(Debug, Error)]
pub enum EstablishError {
    /// The remote host key is not in known_hosts. Never auto-confirmed;
    /// the fingerprint has to be verified manually.
    #[error(
        "unknown host key for {user}@{host}; run `{command}` manually to verify the fingerprint"
    )]
    HostKeyUnverified {
        user: String,
        host: String,
        command: String,
    },

    /// The ssh client could not be spawned at all.
    #[error("failed to launch the ssh client")]
    Launch(#[source] anyhow::Error),
}

/// Seam between the supervisor and the process it drives.
pub trait SessionLauncher {
    /// Spawn one tunnel attempt on a fresh PTY.
    fn launch(&self) -> anyhow::Result<PtySession>;

    /// Human-readable command line, for diagnostics.
    fn describe(&self) -> String;
}

/// Launches the real ssh client with a dynamic (SOCKS) forward.
pub struct SshLauncher {
    profile: Profile,
    local_port: u16,
}

impl SshLauncher {
    pub fn new(profile: Profile, local_port: u16) -> Self {
        Self {
            profile,
            local_port,
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-C".into(),
            "-o".into(),
            "ControlMaster=no".into(),
            "-D".into(),
            self.local_port.to_string(),
            format!("{}@{}", self.profile.user, self.profile.host),
        ]
    }
}

impl SessionLauncher for SshLauncher {
    fn launch(&self) -> anyhow::Result<PtySession> {
        let mut cmd = CommandBuilder::new("ssh");
        cmd.args(self.args());
        PtySession::spawn(cmd)
    }

    fn describe(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.args());
        parts.join(" ")
    }
}

/// Verdict on one spawned attempt.
enum Attempt {
    Established(TunnelSession),
    Transient,
}

/// Establishes tunnel sessions, retrying transient failures forever.
pub struct Supervisor<L> {
    launcher: L,
    profile: Profile,
    local_port: u16,
    connect_timeout: Duration,
    retry_delay: Duration,
}

impl<L: SessionLauncher> Supervisor<L> {
    pub fn new(launcher: L, profile: Profile, settings: &Settings) -> Self {
        Self {
            launcher,
            profile,
            local_port: settings.local_port,
            connect_timeout: settings.connect_timeout(),
            retry_delay: settings.retry_delay(),
        }
    }

    /// Block until a tunnel is up and authenticated.
    ///
    /// Unreachable networks, connect timeouts and the ssh client dying
    /// mid-handshake are logged and retried after a fixed delay, forever.
    /// Only an unverified host key or a broken launch setup gets out of
    /// here as an error.
    pub fn establish(&self) -> Result<TunnelSession, EstablishError> {
        loop {
            info!("Spawning tunnel");
            let pty = self.launcher.launch().map_err(EstablishError::Launch)?;

            match self.connect(pty)? {
                Attempt::Established(session) => return Ok(session),
                // The failed attempt was dropped inside connect(), so the
                // child is gone and the SOCKS port is free before we sleep.
                Attempt::Transient => thread::sleep(self.retry_delay),
            }
        }
    }

    /// Drive one spawned ssh client to a verdict.
    fn connect(&self, mut pty: PtySession) -> Result<Attempt, EstablishError> {
        let patterns: [&Regex; 3] = [&PASSWORD_PROMPT, &HOST_KEY_PROMPT, &NETWORK_UNREACHABLE];
        match pty.expect_any(&patterns, self.connect_timeout) {
            ExpectOutcome::Matched { index: 0 } => self.authenticate(pty),
            ExpectOutcome::Matched { index: 1 } => Err(EstablishError::HostKeyUnverified {
                user: self.profile.user.clone(),
                host: self.profile.host.clone(),
                command: self.launcher.describe(),
            }),
            ExpectOutcome::Matched { .. } => {
                warn!("Network is unreachable; retrying in {:?}", self.retry_delay);
                Ok(Attempt::Transient)
            }
            ExpectOutcome::Eof { transcript } => {
                warn!("ssh exited before authenticating:\n{transcript}");
                warn!("Retrying in {:?}", self.retry_delay);
                Ok(Attempt::Transient)
            }
            ExpectOutcome::TimedOut { .. } => {
                warn!(
                    "Timed out waiting for the ssh client; retrying in {:?}",
                    self.retry_delay
                );
                Ok(Attempt::Transient)
            }
        }
    }

    fn authenticate(&self, mut pty: PtySession) -> Result<Attempt, EstablishError> {
        info!("Authenticating");
        if let Err(err) = pty.send_line(&self.profile.password) {
            warn!("Failed to send credential: {err:#}; retrying in {:?}", self.retry_delay);
            return Ok(Attempt::Transient);
        }

        info!("Waiting for shell prompt");
        match pty.expect_any(&[&self.profile.prompt], self.connect_timeout) {
            ExpectOutcome::Matched { .. } => {
                info!("Tunnel ready; SOCKS listener on 127.0.0.1:{}", self.local_port);
                Ok(Attempt::Established(TunnelSession::new(
                    pty,
                    self.profile.prompt.clone(),
                )))
            }
            ExpectOutcome::Eof { transcript } => {
                warn!("ssh exited while waiting for the shell prompt:\n{transcript}");
                warn!("Retrying in {:?}", self.retry_delay);
                Ok(Attempt::Transient)
            }
            ExpectOutcome::TimedOut { .. } => {
                warn!(
                    "Shell prompt did not appear; retrying in {:?}",
                    self.retry_delay
                );
                Ok(Attempt::Transient)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Emulates the remote side: password prompt, then a shell that answers
    /// every input line with the prompt.
    const AUTH_OK: &str =
        "printf 'password: '; read pw; printf '\\nWelcome\\nvbox$ '; while read line; do printf 'vbox$ '; done";

    const NET_UNREACHABLE: &str =
        "printf 'ssh: connect to host vps.example.net port 22: Network is unreachable\\n'; sleep 5";

    fn profile() -> Profile {
        Profile {
            host: "vps.example.net".into(),
            user: "tunneler".into(),
            password: "s3kr1t".into(),
            prompt: Regex::new(r"vbox\$").unwrap(),
        }
    }

    fn settings() -> Settings {
        Settings {
            connect_timeout_ms: 5_000,
            retry_delay_ms: 10,
            ..Settings::default()
        }
    }

    struct ScriptLauncher {
        scripts: Vec<String>,
        spawned: AtomicUsize,
    }

    impl ScriptLauncher {
        fn new<S: Into<String>>(scripts: Vec<S>) -> Self {
            Self {
                scripts: scripts.into_iter().map(Into::into).collect(),
                spawned: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl SessionLauncher for ScriptLauncher {
        fn launch(&self) -> anyhow::Result<PtySession> {
            let attempt = self.spawned.fetch_add(1, Ordering::SeqCst);
            let script = &self.scripts[attempt.min(self.scripts.len() - 1)];
            let mut cmd = CommandBuilder::new("sh");
            cmd.args(["-c", script.as_str()]);
            PtySession::spawn(cmd)
        }

        fn describe(&self) -> String {
            "sh -c <script>".into()
        }
    }

    fn supervisor(launcher: ScriptLauncher) -> Supervisor<ScriptLauncher> {
        Supervisor::new(launcher, profile(), &settings())
    }

    #[test]
    fn establishes_on_first_attempt() {
        let sup = supervisor(ScriptLauncher::new(vec![AUTH_OK]));
        let mut session = sup.establish().expect("tunnel should come up");
        assert_eq!(sup.launcher.count(), 1);
        assert!(session.probe(Duration::from_secs(5)));
    }

    #[test]
    fn retries_after_network_unreachable() {
        let sup = supervisor(ScriptLauncher::new(vec![NET_UNREACHABLE, AUTH_OK]));
        let session = sup.establish().expect("second attempt should succeed");
        assert_eq!(sup.launcher.count(), 2);
        session.shutdown();
    }

    #[test]
    fn retries_after_unexpected_exit() {
        let sup = supervisor(ScriptLauncher::new(vec!["printf 'garbage\\n'", AUTH_OK]));
        let session = sup.establish().expect("second attempt should succeed");
        assert_eq!(sup.launcher.count(), 2);
        session.shutdown();
    }

    #[test]
    fn retries_after_connect_timeout() {
        let sup = Supervisor::new(
            ScriptLauncher::new(vec!["sleep 3", AUTH_OK]),
            profile(),
            &Settings {
                connect_timeout_ms: 200,
                retry_delay_ms: 10,
                ..Settings::default()
            },
        );
        let session = sup.establish().expect("second attempt should succeed");
        assert_eq!(sup.launcher.count(), 2);
        session.shutdown();
    }

    #[test]
    fn unknown_host_key_is_fatal_and_never_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("accepted");
        let script = format!(
            "printf \"Are you sure you want to continue connecting (yes/no)? \"; \
             read answer; if [ \"$answer\" = \"yes\" ]; then : > {}; fi; sleep 5",
            marker.display()
        );

        let sup = supervisor(ScriptLauncher::new(vec![script]));
        let err = sup.establish().expect_err("host key prompt must be fatal");
        assert!(matches!(err, EstablishError::HostKeyUnverified { .. }));
        assert!(err.to_string().contains("verify the fingerprint"));
        assert_eq!(sup.launcher.count(), 1);
        // The child was torn down without ever being told "yes".
        assert!(!marker.exists());
    }

    #[test]
    fn modern_host_key_prompt_is_recognized() {
        let script = "printf 'continue connecting (yes/no/[fingerprint])? '; sleep 5";
        let sup = supervisor(ScriptLauncher::new(vec![script]));
        let err = sup.establish().expect_err("host key prompt must be fatal");
        assert!(matches!(err, EstablishError::HostKeyUnverified { .. }));
    }

    #[test]
    fn ssh_launcher_command_line() {
        let launcher = SshLauncher::new(profile(), 8088);
        assert_eq!(
            launcher.describe(),
            "ssh -C -o ControlMaster=no -D 8088 tunneler@vps.example.net"
        );
    }
}
