use crate::error::{FeedError, FeedResult};

/// Address the client connects to when none is given.
pub const DEFAULT_CONNECT_ADDR: &str = "127.0.0.1:8080";
/// Address the server listens on when none is given.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Per-connection scratch buffer used by the client.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;
/// Receive buffer used by the server.
pub const DEFAULT_SERVER_BUFFER_CAPACITY: usize = 512;
/// Upper bound on readiness events returned by a single wait.
pub const DEFAULT_MAX_BATCH: usize = 20;

/// Whether a connection waits for the peer's acknowledgment token after
/// its source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Exhaustion moves the connection to `AwaitingAck`; it closes once the
    /// token has been seen.
    #[default]
    Required,
    /// Exhaustion closes the connection directly.
    NotRequired,
}

/// Client engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each connection's scratch and receive buffers.
    pub buffer_capacity: usize,
    /// Maximum number of events taken from the poller per wait.
    pub max_batch: usize,
    /// What happens once a source is exhausted.
    pub ack: AckPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_batch: DEFAULT_MAX_BATCH,
            ack: AckPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Rejects a zero buffer capacity or batch size.
    pub fn validate(&self) -> FeedResult<()> {
        validate_sizes(self.buffer_capacity, self.max_batch)
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the receive buffer shared by all peers.
    pub buffer_capacity: usize,
    /// Maximum number of events taken from the poller per wait.
    pub max_batch: usize,
    /// Write the acknowledgment token when a peer finishes sending.
    pub send_ack: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            buffer_capacity: DEFAULT_SERVER_BUFFER_CAPACITY,
            max_batch: DEFAULT_MAX_BATCH,
            send_ack: true,
        }
    }
}

impl ServerConfig {
    /// Rejects a zero buffer capacity or batch size.
    pub fn validate(&self) -> FeedResult<()> {
        validate_sizes(self.buffer_capacity, self.max_batch)
    }
}

fn validate_sizes(buffer_capacity: usize, max_batch: usize) -> FeedResult<()> {
    if buffer_capacity == 0 {
        return Err(FeedError::InvalidConfig("buffer capacity must be non-zero".into()));
    }
    if max_batch == 0 {
        return Err(FeedError::InvalidConfig("batch size must be non-zero".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_reference_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.max_batch, 20);
        assert_eq!(config.ack, AckPolicy::Required);
        assert!(config.validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case(0, 20)]
    #[case(64, 0)]
    #[case(0, 0)]
    fn zero_sizes_are_rejected(#[case] buffer_capacity: usize, #[case] max_batch: usize) {
        let config = EngineConfig {
            buffer_capacity,
            max_batch,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(FeedError::InvalidConfig(_))));
    }
}
