//! PTY-backed child sessions with expect/send pattern matching.

mod session;

pub use session::{ExpectOutcome, PtySession};
