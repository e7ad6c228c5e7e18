//! Side-effecting adapters: processes, the remote transport, and files.

pub mod config;
pub mod credentials;
pub mod guards;
pub mod probes;
pub mod process;
pub mod prompt;
pub mod remote;
