//! Helpers shared by the engine and the backends.

pub mod crlf;
pub mod exec;
pub mod paths;
