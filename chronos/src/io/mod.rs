//! I/O side of chronos: files, locks, processes.

pub mod atomic;
pub mod config;
pub mod invoker;
pub mod lock;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod sequence;
pub mod session_store;
pub mod transcript;
