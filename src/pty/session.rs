//! Spawns a child process on a pseudo-terminal and drives it with
//! expect/send semantics: accumulate output, wait for the first of several
//! patterns to appear within a deadline, write lines back.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::Regex;

/// Cap on unmatched output kept between expect calls.
const BUFFER_CAP: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// How long to wait after a hangup before force-killing the child.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Outcome of waiting for one of several patterns on a session's output.
#[derive(Debug)]
pub enum ExpectOutcome {
    /// The pattern at this index matched first.
    Matched { index: usize },
    /// The child closed its output stream before any pattern matched.
    Eof { transcript: String },
    /// The deadline passed before any pattern matched.
    TimedOut { transcript: String },
}

/// An interactive child process on a PTY.
///
/// A reader thread drains the PTY master into an mpsc channel; the owning
/// thread blocks on the channel with a deadline while scanning the
/// accumulated output for patterns. Dropping the session terminates and
/// reaps the child.
pub struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    buffer: String,
    // Dropping the master closes the PTY, so it must outlive the child.
    _master: Box<dyn MasterPty + Send>,
}

impl PtySession {
    /// Spawn `cmd` on a fresh PTY and start draining its output.
    pub fn spawn(cmd: CommandBuilder) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn command on PTY")?;
        // Drop our half of the slave so reads see EOF once the child exits.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take PTY writer")?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // On Linux the master read fails with EIO once the
                    // child is gone; treat any error as end of stream.
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            child,
            writer,
            output: rx,
            buffer: String::new(),
            _master: pair.master,
        })
    }

    /// Wait until one of `patterns` matches the accumulated output, the
    /// child closes the stream, or `timeout` expires.
    ///
    /// On a match, output through the end of the match is consumed. When
    /// several patterns match, the one starting earliest in the stream wins,
    /// ties broken by list order.
    pub fn expect_any(&mut self, patterns: &[&Regex], timeout: Duration) -> ExpectOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((index, end)) = self.find_match(patterns) {
                self.buffer.drain(..end);
                return ExpectOutcome::Matched { index };
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => left,
                _ => {
                    return ExpectOutcome::TimedOut {
                        transcript: self.transcript(),
                    }
                }
            };

            match self.output.recv_timeout(remaining) {
                Ok(chunk) => self.absorb(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return ExpectOutcome::TimedOut {
                        transcript: self.transcript(),
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return ExpectOutcome::Eof {
                        transcript: self.transcript(),
                    }
                }
            }
        }
    }

    /// Write `text` followed by a newline to the child's terminal.
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .context("failed to write to PTY")?;
        self.writer
            .write_all(b"\n")
            .context("failed to write to PTY")?;
        self.writer.flush().context("failed to flush PTY writer")?;
        Ok(())
    }

    fn find_match(&self, patterns: &[&Regex]) -> Option<(usize, usize)> {
        patterns
            .iter()
            .enumerate()
            .filter_map(|(index, pat)| {
                pat.find(&self.buffer)
                    .map(|m| (m.start(), index, m.end()))
            })
            .min_by_key(|&(start, index, _)| (start, index))
            .map(|(_, index, end)| (index, end))
    }

    fn absorb(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.buffer.len() > BUFFER_CAP {
            let mut cut = self.buffer.len() - BUFFER_CAP;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }

    /// Unmatched output accumulated so far, for diagnostics.
    fn transcript(&self) -> String {
        self.buffer.trim_end().to_string()
    }

    /// Hang the child up; force-kill if it lingers past the grace period.
    fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Some(pid) = self.child.process_id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}
