use std::{io, sync::Arc};

use thiserror::Error;

use crate::pattern::ExpansionError;

/// Errors reported to observers while the client is running.
///
/// None of these are ever returned to callers of [`StatsdClient::counter`][crate::StatsdClient::counter] or
/// [`StatsdClient::gauge`][crate::StatsdClient::gauge]: they are delivered through
/// [`Observer::warn`][crate::Observer::warn] and logged.
#[derive(Debug, Error)]
pub enum Error {
    /// A stat pattern could not be expanded, so the stat was skipped.
    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    /// The connection to the aggregator failed or was lost.
    #[error(transparent)]
    Transport(Arc<TransportError>),

    /// A stat kind other than a counter or a gauge was requested.
    #[error("unsupported stat type: \"{kind}\"")]
    UnsupportedStatKind {
        /// Name of the requested kind.
        kind: String,
    },
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(Arc::new(e))
    }
}

/// Errors that take the connection to the aggregator down.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection has been established yet.
    #[error("never connected")]
    NeverConnected,

    /// The aggregator's host name could not be resolved.
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
        /// Underlying resolver error, if there was one.
        #[source]
        source: Option<io::Error>,
    },

    /// Connecting, reading or writing failed.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// The aggregator closed the connection.
    #[error("server unexpectedly closed socket")]
    Closed,
}
