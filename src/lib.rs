//! Library replicating databases from an origin to a target server.
//!
//! Every configured origin/target pair becomes a job. Jobs of all backends run
//! concurrently, each one connecting, replicating and closing on its own. The
//! backends are located in the [`backends`] module, the job engine in
//! [`engine`].

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod engine;
pub mod notify;
pub mod util;
