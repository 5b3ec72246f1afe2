//! Backend drivers replicating one origin/target database pair each.
//!
//! Currently the following backends are implemented:
//!
//! - [postgres]: `pg_dump`/`pg_restore` based replication of Postgres databases.
//! - [mongodb]: Collection by collection replication of MongoDB databases.
//!
//! Every backend registers a constructor in the
//! [DriverRegistry](crate::engine::DriverRegistry) with its `register`
//! function. Backends don't know about each other.

pub mod mongodb;
pub mod postgres;

use std::io;
use std::sync::{Mutex, PoisonError, TryLockError};

use derive_more::{Display, Error, From};

use crate::engine::{DriverRegistry, JobLog};
use crate::util::exec::ExecError;

/// Registers all backends built into `cnc`.
pub fn register_builtin(registry: &mut DriverRegistry) {
    postgres::register(registry);
    mongodb::register(registry);
}

/// Result of [Driver::connect] if no error occurred.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Origin and target are connected.
    Connected,
    /// The record is disabled, nothing was connected.
    Disabled,
}

#[derive(Debug, Display, Error, From)]
/// Errors of a [Driver].
pub enum DriverError {
    /// Establishing a connection failed.
    #[display("connecting to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    /// A database client call failed after the connection was established.
    #[display("{_0}")]
    Client(#[error(ignore)] String),
    /// [Driver::replicate] was called without connected handles.
    #[display("{_0} connection is not established")]
    NotConnected(#[error(ignore)] &'static str),
    /// A dump or restore program failed.
    #[from]
    #[display("{_0}")]
    Subprocess(ExecError),
    #[from]
    #[display("I/O error: {_0}")]
    Io(io::Error),
}

/// The operations a job runs, in order: `connect`, `replicate` (only after a
/// successful connect) and `close` (always, once connect was attempted).
pub trait Driver: Send {
    /// Connects to origin and target.
    fn connect(&mut self, log: &mut JobLog) -> Result<ConnectOutcome, DriverError>;

    /// Copies the origin database into the target database.
    fn replicate(&mut self, log: &mut JobLog) -> Result<(), DriverError>;

    /// Releases everything acquired by `connect` and `replicate`.
    ///
    /// Has to be safe to call in every state, including after a failed or
    /// skipped `connect`.
    fn close(&mut self, log: &mut JobLog) -> Result<(), DriverError>;
}

/// Serializes connection establishment of one backend.
///
/// Only held while a connection is being established, never while a job
/// replicates.
#[derive(Debug, Default)]
pub struct ConnectLock(Mutex<()>);

impl ConnectLock {
    pub const fn new() -> Self {
        Self(Mutex::new(()))
    }

    /// Runs `connect` while holding the lock.
    pub fn connect<T>(&self, connect: impl FnOnce() -> T) -> T {
        let _guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        connect()
    }

    /// Returns if another connection is being established right now.
    pub fn is_held(&self) -> bool {
        matches!(self.0.try_lock(), Err(TryLockError::WouldBlock))
    }
}

/// A connection handle of a [Driver].
#[derive(Debug, Default)]
pub enum Handle<T> {
    /// `connect` didn't succeed (yet).
    #[default]
    Unset,
    Open(T),
    /// Released by `close`, terminal.
    Closed,
}

impl<T> Handle<T> {
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Open(inner) => Some(inner),
            Self::Unset | Self::Closed => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Marks the handle closed, returning the open connection if there was one.
    pub fn close(&mut self) -> Option<T> {
        match std::mem::replace(self, Self::Closed) {
            Self::Open(inner) => Some(inner),
            Self::Unset | Self::Closed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_closed_after_close_in_every_state() {
        let mut unset: Handle<u8> = Handle::default();
        assert_eq!(unset.close(), None);
        assert!(unset.is_closed());

        let mut open = Handle::Open(7);
        assert!(open.is_open());
        assert_eq!(open.close(), Some(7));
        assert!(open.is_closed());
        assert_eq!(open.close(), None);
        assert!(open.get_mut().is_none());
    }

    #[test]
    fn connect_lock_is_released_after_connecting() {
        let lock = ConnectLock::new();

        let held = lock.connect(|| lock.is_held());

        assert!(held);
        assert!(!lock.is_held());
    }

    #[test]
    fn connect_lock_survives_a_panicking_connect() {
        let lock = ConnectLock::new();

        let panicked = std::panic::catch_unwind(|| lock.connect(|| panic!("connect bug")));

        assert!(panicked.is_err());
        assert!(!lock.is_held());
        assert_eq!(lock.connect(|| 7), 7);
    }
}
