//! Liveness monitoring for the established tunnel.

mod watchdog;

pub use watchdog::{ProbeVerdict, Watchdog};
