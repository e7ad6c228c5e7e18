//! Supervised dispatch of long-running tasks to remote worker targets.
//!
//! `warden` hands a task to an autonomous worker loop on a remote target,
//! watches it for signs of unproductive behaviour, and decides a trustworthy
//! outcome even when the worker never signals completion. The layout follows
//! a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (grace periods, outcome
//!   classification, status parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (process execution, the remote
//!   transport, probe scripts, config). Isolated behind traits for tests.
//!
//! Orchestration modules ([`dispatch`], [`wait`]) coordinate the two, with the
//! safety machinery in [`offrails`], [`stream`] and [`cancel`].

pub mod cancel;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod offrails;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod wait;
