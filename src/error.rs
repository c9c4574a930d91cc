use thiserror::Error;

/// Errors that can occur while tethering a BLE peripheral
#[derive(Error, Debug)]
pub enum TetherError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Transport-level failure reported by the adapter
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection attempt timed out
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// No peripheral is currently connected
    #[error("no peripheral connected")]
    NotConnected,

    /// The peripheral is unknown to the transport
    #[error("peripheral not registered with transport: {0}")]
    UnknownPeripheral(uuid::Uuid),

    /// The command endpoint has not been resolved on this connection
    #[error("command endpoint not resolved")]
    EndpointUnresolved,

    /// The command characteristic does not accept writes
    #[error("command endpoint is not writable")]
    EndpointNotWritable,

    /// The command text was empty or blank
    #[error("command text is empty")]
    EmptyCommand,

    /// A fixed protocol identifier failed to parse
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;

impl TetherError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Transport(_) | Self::ConnectTimeout { .. } | Self::NotConnected
        )
    }

    /// Check if this error is a synchronous validation rejection
    ///
    /// Validation rejections are reported before any transport call is made
    /// and are surfaced to the caller to fix and retry.
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyCommand | Self::EndpointUnresolved | Self::EndpointNotWritable
        )
    }
}
