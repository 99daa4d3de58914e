//! Error types for the RFB gateway.

use std::io;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while the gateway talks to an upstream RFB server
/// or multiplexes it to subscribers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error occurred on the upstream socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer did not speak RFB, or sent a malformed handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The upstream only offered security types this gateway cannot satisfy
    /// without a password (VNC authentication, type 2).
    #[error("upstream requires VNC authentication, which is not supported")]
    AuthenticationRequired,

    /// The upstream's `SecurityResult` was non-zero.
    #[error("security handshake rejected by upstream")]
    SecurityRejected,

    /// A rectangle used an encoding the gateway did not advertise support for.
    #[error("unsupported rectangle encoding: {0}")]
    UnsupportedEncoding(i32),

    /// The server sent a message type the gateway does not understand.
    #[error("unknown server message type: {0}")]
    UnknownMessageType(u8),

    /// The connection closed mid-message (short read).
    #[error("connection closed")]
    ConnectionClosed,

    /// A rectangle or pixel format was structurally invalid.
    #[error("invalid rectangle or pixel format: {0}")]
    InvalidGeometry(String),

    /// No RFB session is running for the requested upstream.
    #[error("no active session for {0}")]
    SessionNotFound(String),

    /// Image compression failed.
    #[error("image encoding failed: {0}")]
    Encoding(String),
}
