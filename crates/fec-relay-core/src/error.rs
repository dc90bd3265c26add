//! Error taxonomy for the relay core.
//!
//! `RelayError` covers everything a caller at the I/O task boundary needs to
//! react to; `CodecError` is the narrower set a codec adapter can fail with.
//! `ClockWentBackwards` and a popped-empty-queue are programming invariant
//! violations, not `Result` cases — they panic where they are detected.

use thiserror::Error;

/// Errors produced by the packet codec and the FEC codec adapters.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A received datagram was too short for its declared type, named an
    /// unknown packet type, or carried a non-zero version.
    #[error("bad packet: {0}")]
    BadPacket(&'static str),

    /// The underlying FEC codec reported corrupted or inconsistent input.
    #[error("bad symbol: {0}")]
    BadSymbol(&'static str),
}

/// Top-level error type returned by relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error on send to {peer}: {source}")]
    SendFailed {
        peer: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on receive: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}
