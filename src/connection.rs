use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::ops::Range;
use std::os::unix::net::UnixStream;

use crate::error::{FeedError, FeedResult};
use crate::registry::{Handle, Registry};
use crate::transfer::ProtocolState;

/// Literal token the peer sends once it has consumed the stream.
pub const ACK_TOKEN: &[u8] = b"Ack\n";

/// A byte channel the transfer machine can drive without blocking.
pub trait Channel: Read + Write {
    /// Switches the channel between blocking and non-blocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Half-closes the outbound direction so the peer observes end-of-input.
    fn shutdown_write(&self) -> io::Result<()>;
}

impl Channel for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl Channel for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

/// Allocates a zeroed buffer, reporting allocator refusal instead of aborting.
pub(crate) fn zeroed_buffer(capacity: usize) -> FeedResult<Box<[u8]>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(capacity).map_err(|e| {
        FeedError::ResourceExhausted(format!("cannot allocate a {capacity} byte buffer: {e}"))
    })?;
    buffer.resize(capacity, 0);
    Ok(buffer.into_boxed_slice())
}

/// Finds [`ACK_TOKEN`] in a byte stream that arrives in arbitrary pieces.
#[derive(Debug, Default)]
pub(crate) struct AckMatcher {
    tail: Vec<u8>,
}

impl AckMatcher {
    /// Feeds the next received bytes; true once the token has been seen.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> bool {
        self.tail.extend_from_slice(bytes);
        if self.tail.windows(ACK_TOKEN.len()).any(|w| w == ACK_TOKEN) {
            self.tail.clear();
            return true;
        }
        let keep = self.tail.len().min(ACK_TOKEN.len() - 1);
        self.tail.drain(..self.tail.len() - keep);
        false
    }
}

/// One outbound channel, the source it streams, and its protocol state.
///
/// The record owns both the channel and the source. Dropping it closes them.
pub struct Connection<C, S> {
    pub(crate) channel: C,
    pub(crate) source: Option<S>,
    /// Holds bytes read from the source; `pending` marks the part not yet sent.
    pub(crate) scratch: Box<[u8]>,
    pub(crate) pending: Range<usize>,
    pub(crate) inbox: Box<[u8]>,
    pub(crate) state: ProtocolState,
    pub(crate) ack_seen: bool,
    /// The peer shut down its side after sending something.
    pub(crate) peer_eof: bool,
    pub(crate) ack: AckMatcher,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl<C, S> Connection<C, S> {
    /// Creates a record in the `Streaming` state with buffers of `capacity` bytes.
    ///
    /// Fails with [`FeedError::ResourceExhausted`] if the buffers cannot be
    /// allocated.
    pub fn new(channel: C, source: S, capacity: usize) -> FeedResult<Self> {
        Ok(Connection {
            channel,
            source: Some(source),
            scratch: zeroed_buffer(capacity)?,
            pending: 0..0,
            inbox: zeroed_buffer(capacity)?,
            state: ProtocolState::Streaming,
            ack_seen: false,
            peer_eof: false,
            ack: AckMatcher::default(),
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    /// Returns the channel this record streams to.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Returns the current protocol state.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// True until the source has been exhausted and closed.
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Bytes read from the source but not yet accepted by the channel.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True once the acknowledgment token has been received.
    pub fn ack_seen(&self) -> bool {
        self.ack_seen
    }

    /// True once the peer has shut down its sending side while this side
    /// still had data to stream.
    pub fn peer_eof(&self) -> bool {
        self.peer_eof
    }

    /// Bytes accepted by the channel so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes received from the peer so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Capacity of the scratch buffer.
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }
}

impl<C, S> Registry<Connection<C, S>> {
    /// Creates a `Streaming` record for `channel` and `source`.
    pub fn register(&mut self, channel: C, source: S, capacity: usize) -> FeedResult<Handle> {
        self.insert(Connection::new(channel, source, capacity)?)
    }
}
