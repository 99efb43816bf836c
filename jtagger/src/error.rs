//! The crate-level error type.

use crate::cable::{DeviceError, IoError, ProtocolError};
use crate::chain::ScanError;
use crate::config::ConfigError;
use crate::parts::DatabaseError;
use crate::template::BuildError;

/// Anything the driver stack can fail with.
///
/// Subsystem errors keep their own types; this enum only aggregates them at
/// the public API boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Illegal template composition; always a programmer error.
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
