//! Per-connection transfer state machine.
//!
//! ```text
//! Streaming --[source exhausted]--> AwaitingAck --[ack token seen]--> Closed
//! Streaming --[peer shutdown or reset]--> Closed
//! AwaitingAck --[peer shutdown or reset]--> Closed
//! ```
//!
//! With [`AckPolicy::NotRequired`] exhaustion goes straight to `Closed` and
//! `AwaitingAck` is never entered.
//!
//! Channels are registered edge-triggered, so both handlers work until the
//! channel reports `WouldBlock` (or the connection reaches a terminal
//! state) before returning.

use std::io::{self, Read};

use crate::config::AckPolicy;
use crate::connection::{Channel, Connection};
use crate::error::{FeedError, FeedResult};

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// The source is being sent. Initial state.
    Streaming,
    /// The source is exhausted; waiting for the acknowledgment token.
    AwaitingAck,
    /// Terminal.
    Closed,
}

impl ProtocolState {
    /// True when `next` is an edge of the transition diagram.
    pub fn can_advance(self, next: ProtocolState) -> bool {
        matches!(
            (self, next),
            (ProtocolState::Streaming, ProtocolState::AwaitingAck)
                | (ProtocolState::Streaming, ProtocolState::Closed)
                | (ProtocolState::AwaitingAck, ProtocolState::Closed)
        )
    }
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Source exhausted and the acknowledgment token received.
    Acknowledged,
    /// Source exhausted, no acknowledgment required.
    Completed,
    /// The peer performed an orderly shutdown.
    PeerShutdown,
    /// The peer reset the connection.
    PeerReset,
    /// A send, receive or source read failed.
    Failed,
}

/// What a handler left the connection in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The connection stays registered.
    Open,
    /// The connection reached `Closed` and must be retired.
    Closed(CloseReason),
}

/// Result of a single write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// The channel accepted this many bytes.
    Sent(usize),
    /// The channel's outbound buffer is full; pending bytes are retained.
    WouldBlock,
    /// A zero-byte read from the source.
    Exhausted,
    /// The peer is gone.
    Reset,
}

fn is_reset(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl<C: Channel, S: Read> Connection<C, S> {
    /// Performs one write cycle: refills the scratch buffer from the source if
    /// nothing is pending, then tries to send the pending bytes once.
    ///
    /// A short send or `WouldBlock` keeps the unsent remainder; the next
    /// cycle sends it before reading anything new from the source.
    pub fn write_cycle(&mut self) -> FeedResult<Cycle> {
        if self.pending.is_empty() {
            let Some(source) = self.source.as_mut() else {
                return Err(FeedError::ProtocolViolation(format!(
                    "write cycle in state {:?} without a source",
                    self.state
                )));
            };
            let n = loop {
                match source.read(&mut self.scratch) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(FeedError::SourceFailed(e)),
                }
            };
            if n == 0 {
                return Ok(Cycle::Exhausted);
            }
            self.pending = 0..n;
        }

        loop {
            match self.channel.write(&self.scratch[self.pending.clone()]) {
                Ok(0) => return Err(FeedError::SendFailed(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    if n < self.pending.len() {
                        log::debug!("Short send: {n} of {} bytes", self.pending.len());
                    }
                    self.pending.start += n;
                    self.bytes_sent += n as u64;
                    return Ok(Cycle::Sent(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Cycle::WouldBlock),
                Err(e) if is_reset(e.kind()) => {
                    log::debug!("Peer reset while sending: {e}");
                    return Ok(Cycle::Reset);
                }
                Err(e) => return Err(FeedError::SendFailed(e)),
            }
        }
    }

    /// Handles a writable notification.
    ///
    /// Ignored unless the connection is still `Streaming`: writable edges
    /// keep arriving while the connection waits for its acknowledgment.
    pub fn on_writable(&mut self, policy: AckPolicy) -> FeedResult<Progress> {
        match self.state {
            ProtocolState::Streaming => {}
            ProtocolState::AwaitingAck => return Ok(Progress::Open),
            ProtocolState::Closed => {
                return Err(FeedError::ProtocolViolation(
                    "writable event for a closed connection".into(),
                ));
            }
        }

        loop {
            match self.write_cycle()? {
                Cycle::Sent(_) => continue,
                Cycle::WouldBlock => return Ok(Progress::Open),
                Cycle::Reset => return self.close(CloseReason::PeerReset),
                Cycle::Exhausted => return self.finish_source(policy),
            }
        }
    }

    /// Handles a readable notification by draining the channel until it
    /// would block.
    pub fn on_readable(&mut self, policy: AckPolicy) -> FeedResult<Progress> {
        if self.state == ProtocolState::Closed {
            return Err(FeedError::ProtocolViolation(
                "readable event for a closed connection".into(),
            ));
        }
        if self.peer_eof {
            // readiness reported alongside a writable edge; the peer has nothing more to say
            return Ok(Progress::Open);
        }

        let mut received = 0usize;
        let mut peer_closed = false;
        loop {
            match self.channel.read(&mut self.inbox) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    received += n;
                    if self.ack.feed(&self.inbox[..n]) {
                        self.ack_seen = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_reset(e.kind()) => {
                    self.bytes_received += received as u64;
                    log::debug!("Peer reset while receiving: {e}");
                    return self.close(CloseReason::PeerReset);
                }
                Err(e) => return Err(FeedError::ReceiveFailed(e)),
            }
        }
        self.bytes_received += received as u64;

        if received > 0 {
            log::debug!("Drained {received} bytes in state {:?}", self.state);
        }

        if policy == AckPolicy::Required && self.ack_seen {
            match self.state {
                ProtocolState::AwaitingAck => return self.close(CloseReason::Acknowledged),
                _ => log::debug!("Acknowledgment arrived before exhaustion, deferring close"),
            }
        }

        if peer_closed {
            if self.state == ProtocolState::Streaming && received > 0 {
                log::debug!("Peer finished sending, streaming continues until exhaustion");
                self.peer_eof = true;
                return Ok(Progress::Open);
            }
            return self.close(CloseReason::PeerShutdown);
        }
        Ok(Progress::Open)
    }

    fn finish_source(&mut self, policy: AckPolicy) -> FeedResult<Progress> {
        // closes the file
        self.source = None;
        log::debug!("Source exhausted after {} bytes", self.bytes_sent);

        match policy {
            AckPolicy::NotRequired => self.close(CloseReason::Completed),
            // no acknowledgment can arrive any more
            AckPolicy::Required if self.peer_eof => {
                if self.ack_seen {
                    self.close(CloseReason::Acknowledged)
                } else {
                    self.close(CloseReason::PeerShutdown)
                }
            }
            AckPolicy::Required => {
                if let Err(e) = self.channel.shutdown_write() {
                    if e.kind() == io::ErrorKind::NotConnected || is_reset(e.kind()) {
                        return self.close(CloseReason::PeerReset);
                    }
                    return Err(FeedError::SendFailed(e));
                }
                self.advance(ProtocolState::AwaitingAck)?;
                if self.ack_seen {
                    return self.close(CloseReason::Acknowledged);
                }
                Ok(Progress::Open)
            }
        }
    }

    /// Moves to `Closed`. Releasing the channel is up to the owner of the record.
    pub(crate) fn close(&mut self, reason: CloseReason) -> FeedResult<Progress> {
        self.advance(ProtocolState::Closed)?;
        Ok(Progress::Closed(reason))
    }
}

impl<C, S> Connection<C, S> {
    pub(crate) fn advance(&mut self, next: ProtocolState) -> FeedResult<()> {
        if !self.state.can_advance(next) {
            return Err(FeedError::ProtocolViolation(format!(
                "illegal transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Marks a connection closed after a connection-fatal error.
    pub(crate) fn fail(&mut self) -> CloseReason {
        self.state = ProtocolState::Closed;
        CloseReason::Failed
    }
}
