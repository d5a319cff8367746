use std::fmt;

use bchd_primitives::DecodeError;

/// Failure taxonomy for the message engine. The receive pump decides per
/// variant whether to skip the message, flag the peer, or tear the
/// connection down; only `Fatal` escapes the peer entirely.
#[derive(Debug)]
pub enum NetError {
    Io(std::io::Error),
    /// The 4-byte message start did not match our network.
    BadMagic,
    /// Malformed 24-byte header (non-ascii command, absurd length).
    BadHeader(&'static str),
    /// A frame announced a payload beyond the protocol ceiling.
    OversizeFrame(usize),
    /// Payload deserialization failed; maps to REJECT(MALFORMED).
    Malformed {
        command: String,
        error: DecodeError,
    },
    /// Peer broke a protocol rule; misbehavior has already been charged.
    Protocol(String),
    /// Unrecoverable local error; the node must shut down.
    Fatal(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Io(err) => write!(f, "{err}"),
            NetError::BadMagic => write!(f, "invalid message start"),
            NetError::BadHeader(message) => write!(f, "bad message header: {message}"),
            NetError::OversizeFrame(size) => write!(f, "oversized message ({size} bytes)"),
            NetError::Malformed { command, error } => {
                write!(f, "malformed {command} payload: {error}")
            }
            NetError::Protocol(message) => write!(f, "{message}"),
            NetError::Fatal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io(err)
    }
}
