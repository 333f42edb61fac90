//! Error types for Plejd mesh operations
//!
//! Errors are grouped the way they are handled: transient link errors are
//! recovered by command retry or session reconnect, discovery failures feed
//! the reconnect loop, protocol anomalies are logged and dropped, and
//! configuration errors are fatal at startup.

use thiserror::Error;

/// Main error type for Plejd mesh operations
#[derive(Error, Debug)]
pub enum PlejdError {
    // ===== Transport/Link Errors =====
    /// The session has no authenticated link to a gateway
    #[error("Not connected to a mesh gateway")]
    NotConnected,

    /// The transport object backing the link disappeared
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// Characteristic write failed
    #[error("Write error: {0}")]
    WriteError(String),

    /// Characteristic read failed
    #[error("Read error: {0}")]
    ReadError(String),

    /// Generic transport failure reported by the BLE stack
    #[error("Transport error: {0}")]
    Transport(String),

    /// Keepalive answer did not match the probe
    #[error("Ping mismatch: sent 0x{sent:02x}, expected 0x{expected:02x}, got {received:?}")]
    PingMismatch {
        /// Byte written to the ping characteristic
        sent: u8,
        /// Byte the gateway should have answered with
        expected: u8,
        /// Byte actually read back, if any
        received: Option<u8>,
    },

    // ===== Discovery/Connect Errors =====
    /// No mesh gateway advertised during the discovery window
    #[error("No mesh gateways found within {window_ms}ms")]
    NoCandidates {
        /// Discovery window in milliseconds
        window_ms: u64,
    },

    /// Every discovered candidate failed to connect or authenticate
    #[error("All {count} candidate gateways failed")]
    AllCandidatesFailed {
        /// Number of candidates tried
        count: usize,
    },

    /// A required GATT characteristic is not exposed by the peer
    #[error("Missing GATT characteristic: {0}")]
    MissingCharacteristic(&'static str),

    /// Connecting to a candidate failed
    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed {
        /// BLE address of the candidate
        address: String,
        /// Failure reason
        reason: String,
    },

    /// Authentication handshake failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A reconnect iteration did not finish before the watchdog fired
    #[error("Watchdog expired after {duration_ms}ms")]
    WatchdogExpired {
        /// Watchdog timeout in milliseconds
        duration_ms: u64,
    },

    // ===== Protocol Errors =====
    /// Decrypted frame shorter than the protocol header
    #[error("Frame too short: {len} bytes (minimum {min})")]
    FrameTooShort {
        /// Actual frame length
        len: usize,
        /// Minimum frame length
        min: usize,
    },

    /// Challenge of unexpected size during authentication
    #[error("Invalid challenge length: {0} bytes")]
    InvalidChallenge(usize),

    /// Address not registered in the device directory
    #[error("Unknown mesh address: {0}")]
    UnknownAddress(u8),

    /// Logical device id not registered in the device directory
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    // ===== Command Errors =====
    /// Retry bound exceeded for a queued command
    #[error("Command for {logical_id} dropped after {retries} retries")]
    RetriesExhausted {
        /// Logical device id
        logical_id: String,
        /// Retries attempted
        retries: u32,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// No usable Bluetooth adapter on this host
    #[error("No compatible Bluetooth adapter: {0}")]
    NoAdapter(String),

    /// Mesh key could not be parsed
    #[error("Invalid mesh key: {0}")]
    InvalidKey(String),

    // ===== General Errors =====
    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlejdError {
    /// Build a transport error from a BLE stack message, recognising the
    /// messages that mean the link itself is gone.
    pub fn from_transport_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message_means_link_down(&message) {
            PlejdError::LinkLost(message)
        } else {
            PlejdError::Transport(message)
        }
    }

    /// Check if this error means the link is down and the session must
    /// reconnect right away
    pub fn is_link_down(&self) -> bool {
        match self {
            PlejdError::NotConnected | PlejdError::LinkLost(_) => true,
            PlejdError::WriteError(msg)
            | PlejdError::ReadError(msg)
            | PlejdError::Transport(msg) => message_means_link_down(msg),
            _ => false,
        }
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PlejdError::NotConnected
                | PlejdError::LinkLost(_)
                | PlejdError::WriteError(_)
                | PlejdError::ReadError(_)
                | PlejdError::Transport(_)
                | PlejdError::PingMismatch { .. }
                | PlejdError::NoCandidates { .. }
                | PlejdError::AllCandidatesFailed { .. }
                | PlejdError::ConnectFailed { .. }
                | PlejdError::AuthFailed(_)
                | PlejdError::MissingCharacteristic(_)
                | PlejdError::WatchdogExpired { .. }
        )
    }

    /// Check if this error is a host or account misconfiguration that
    /// should stop initialization
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlejdError::InvalidConfig(_)
                | PlejdError::MissingConfig(_)
                | PlejdError::NoAdapter(_)
                | PlejdError::InvalidKey(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            PlejdError::NotConnected => "NOT_CONNECTED",
            PlejdError::LinkLost(_) => "LINK_LOST",
            PlejdError::WriteError(_) => "WRITE_ERROR",
            PlejdError::ReadError(_) => "READ_ERROR",
            PlejdError::Transport(_) => "TRANSPORT_ERROR",
            PlejdError::PingMismatch { .. } => "PING_MISMATCH",
            PlejdError::NoCandidates { .. } => "NO_CANDIDATES",
            PlejdError::AllCandidatesFailed { .. } => "ALL_CANDIDATES_FAILED",
            PlejdError::MissingCharacteristic(_) => "MISSING_CHARACTERISTIC",
            PlejdError::ConnectFailed { .. } => "CONNECT_FAILED",
            PlejdError::AuthFailed(_) => "AUTH_FAILED",
            PlejdError::WatchdogExpired { .. } => "WATCHDOG_EXPIRED",
            PlejdError::FrameTooShort { .. } => "FRAME_TOO_SHORT",
            PlejdError::InvalidChallenge(_) => "INVALID_CHALLENGE",
            PlejdError::UnknownAddress(_) => "UNKNOWN_ADDRESS",
            PlejdError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            PlejdError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            PlejdError::InvalidConfig(_) => "INVALID_CONFIG",
            PlejdError::MissingConfig(_) => "MISSING_CONFIG",
            PlejdError::NoAdapter(_) => "NO_ADAPTER",
            PlejdError::InvalidKey(_) => "INVALID_KEY",
            PlejdError::ChannelError(_) => "CHANNEL_ERROR",
            PlejdError::ChannelClosed => "CHANNEL_CLOSED",
            PlejdError::Json(_) => "JSON_ERROR",
            PlejdError::Io(_) => "IO_ERROR",
        }
    }
}

fn message_means_link_down(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("not connected")
        || lower.contains("unknownobject")
        || lower.contains("unknown object")
        || lower.contains("does not exist")
}

/// Result type alias for Plejd mesh operations
pub type Result<T> = std::result::Result<T, PlejdError>;

impl From<hex::FromHexError> for PlejdError {
    fn from(err: hex::FromHexError) -> Self {
        PlejdError::InvalidKey(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PlejdError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PlejdError::ChannelError(err.to_string())
    }
}

// Conversion from BlueZ errors (only when the bluez feature is enabled)
#[cfg(feature = "bluez")]
impl From<bluer::Error> for PlejdError {
    fn from(err: bluer::Error) -> Self {
        PlejdError::from_transport_message(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(PlejdError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(
            PlejdError::RetriesExhausted {
                logical_id: "light-1".into(),
                retries: 10
            }
            .error_code(),
            "RETRIES_EXHAUSTED"
        );
    }

    #[test]
    fn test_link_down_detection() {
        assert!(PlejdError::NotConnected.is_link_down());
        assert!(PlejdError::WriteError("Not connected".into()).is_link_down());
        assert!(
            PlejdError::Transport("org.freedesktop.DBus.Error.UnknownObject: gone".into())
                .is_link_down()
        );
        assert!(!PlejdError::WriteError("Operation already in progress".into()).is_link_down());
        assert!(!PlejdError::PingMismatch {
            sent: 1,
            expected: 2,
            received: Some(7)
        }
        .is_link_down());
    }

    #[test]
    fn test_from_transport_message() {
        assert!(matches!(
            PlejdError::from_transport_message("Method call failed: Not connected"),
            PlejdError::LinkLost(_)
        ));
        assert!(matches!(
            PlejdError::from_transport_message("In Progress"),
            PlejdError::Transport(_)
        ));
    }

    #[test]
    fn test_fatal_vs_retriable() {
        assert!(PlejdError::NoAdapter("hci0".into()).is_fatal());
        assert!(PlejdError::InvalidKey("odd length".into()).is_fatal());
        assert!(!PlejdError::NoAdapter("hci0".into()).is_retriable());
        assert!(PlejdError::NoCandidates { window_ms: 5000 }.is_retriable());
        assert!(!PlejdError::NoCandidates { window_ms: 5000 }.is_fatal());
    }

    #[test]
    fn test_ping_mismatch_message() {
        let err = PlejdError::PingMismatch {
            sent: 0xff,
            expected: 0x00,
            received: Some(0x10),
        };
        assert!(err.to_string().contains("0xff"));
        assert!(err.to_string().contains("0x00"));
    }
}
