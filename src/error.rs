use std::io;
use std::net::SocketAddr;

/// Result type used throughout the crate.
pub type FeedResult<T> = Result<T, FeedError>;

/// Errors raised by the feed engine and its collaborators.
///
/// Variants fall into two groups. Connection-fatal errors
/// ([`FeedError::SendFailed`], [`FeedError::ReceiveFailed`],
/// [`FeedError::SourceFailed`]) close the connection they occurred on and
/// nothing else. Every other variant is fatal to the process: the engine
/// releases all connections and hands the error back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The allocator could not make room for another record.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The OS could not provide the readiness facility.
    #[error("readiness facility error: {0}")]
    SystemResource(#[source] io::Error),

    /// A channel could not be added to or removed from the poller.
    #[error("registration error: {0}")]
    Registration(#[source] io::Error),

    /// Sending on a channel failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),

    /// Receiving from a channel failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] io::Error),

    /// Reading the byte source failed for a reason other than EOF.
    #[error("source read failed: {0}")]
    SourceFailed(#[source] io::Error),

    /// A state combination the transfer machine never produces.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connecting to the server failed.
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        /// The server address.
        addr: SocketAddr,
        /// Why the connect failed.
        #[source]
        source: io::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FeedError {
    /// Returns true when the error only terminates the connection it was
    /// raised on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            FeedError::SendFailed(_) | FeedError::ReceiveFailed(_) | FeedError::SourceFailed(_)
        )
    }
}
