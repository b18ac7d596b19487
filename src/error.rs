//! Error taxonomy for coordinator and characteristic I/O operations.

use thiserror::Error;

/// Failures surfaced to callers of this crate.
///
/// Driver-reported read/write/notify failures are not errors here; they
/// arrive as the boolean success flag of the relevant result callback.
#[derive(Debug, Error)]
pub enum Error {
    /// The radio is not powered on, or an operation of the same kind is
    /// already in flight.
    #[error("adapter not ready: {0}")]
    NotReady(&'static str),

    /// A gate wait exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation requires a connected device.
    #[error("no device connected")]
    NotConnected,

    /// The characteristic id is not present on the connected device.
    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(String),

    /// The underlying radio driver rejected a request.
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}
