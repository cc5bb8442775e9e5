//! Runs an AFL-instrumented program exactly once and shows which tuples it hit.
//!
//! The [`bitmap::CoverageBitmap`] is shared with the target through SysV shared memory,
//! [`forkserver::ForkServerClient`] drives one run through the fork server handshake and
//! [`classify`] and [`report`] turn the raw hit counts into the textual map.

pub mod bitmap;
pub mod classify;
pub mod cli;
pub mod config;
pub mod error;
pub mod forkserver;
pub mod log;
pub mod report;
pub mod session;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
