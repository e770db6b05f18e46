//! Single-threaded event loop that drives every connection to completion.
//!
//! The engine owns the [`Multiplexer`], the [`Registry`] of connections and
//! the active-connection count. [`Engine::run`] blocks in
//! [`Multiplexer::wait`], dispatches the whole batch to the transfer state
//! machine, retires connections that reached `Closed`, and loops until no
//! connection is active.

use std::io::Read;
use std::os::fd::AsFd;

use crate::config::EngineConfig;
use crate::connection::{Channel, Connection};
use crate::error::{FeedError, FeedResult};
use crate::mux::{Interest, Multiplexer, Readiness, Wait};
use crate::registry::{Handle, Registry};
use crate::transfer::{CloseReason, Progress};

/// How an event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Every connection reached a terminal state.
    Completed,
    /// A watched signal asked the loop to stop. Remaining connections were
    /// released.
    Interrupted,
}

/// Final accounting of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Handle the connection was registered under.
    pub handle: Handle,
    /// Why the connection closed.
    pub reason: CloseReason,
    /// Bytes sent to the peer.
    pub bytes_sent: u64,
    /// Bytes received from the peer.
    pub bytes_received: u64,
}

/// Event loop driver over a set of connections.
pub struct Engine<C: Channel + AsFd, S: Read> {
    config: EngineConfig,
    mux: Multiplexer,
    connections: Registry<Connection<C, S>>,
    active: usize,
    batch: Vec<Readiness>,
    outcomes: Vec<Outcome>,
}

impl<C: Channel + AsFd, S: Read> Engine<C, S> {
    /// Creates an engine with no connections.
    pub fn new(config: EngineConfig) -> FeedResult<Self> {
        config.validate()?;
        let mux = Multiplexer::new(config.max_batch)?;
        let batch = Vec::with_capacity(config.max_batch);
        Ok(Engine {
            config,
            mux,
            connections: Registry::new(),
            active: 0,
            batch,
            outcomes: Vec::new(),
        })
    }

    /// Takes ownership of `channel` and `source`, switches the channel to
    /// non-blocking mode and watches it for both readiness directions.
    pub fn add(&mut self, channel: C, source: S) -> FeedResult<Handle> {
        channel
            .set_nonblocking(true)
            .map_err(FeedError::Registration)?;
        let handle = self
            .connections
            .register(channel, source, self.config.buffer_capacity)?;
        let Some(record) = self.connections.get(handle) else {
            return Err(FeedError::ProtocolViolation(format!(
                "record {handle} vanished after registration"
            )));
        };
        if let Err(e) = self.mux.watch(record.channel(), Interest::both(), handle.key()) {
            self.connections.remove(handle);
            return Err(e);
        }
        self.active += 1;
        log::debug!("Added connection {handle}, {} active", self.active);
        Ok(handle)
    }

    /// Routes `signals` to the wait so that they end [`run`](Self::run) with
    /// [`Exit::Interrupted`].
    pub fn interrupt_on(&mut self, signals: &[i32]) -> FeedResult<()> {
        self.mux.interrupt_on(signals)
    }

    /// Number of connections that have not reached `Closed`.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Terminal outcome of every retired connection, in closing order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Returns the live record named by `handle`.
    pub fn connection(&self, handle: Handle) -> Option<&Connection<C, S>> {
        self.connections.get(handle)
    }

    /// True if the channel of `handle` is still watched by the multiplexer.
    pub fn is_watched(&self, handle: Handle) -> bool {
        self.connections
            .get(handle)
            .is_some_and(|record| self.mux.is_watched(record.channel()))
    }

    /// Runs until every connection is closed or a signal interrupts the wait.
    ///
    /// Process-fatal errors release every remaining connection before they
    /// are returned.
    pub fn run(&mut self) -> FeedResult<Exit> {
        while self.active > 0 {
            match self.mux.wait(&mut self.batch) {
                Ok(Wait::Ready) => {}
                Ok(Wait::Interrupted) => {
                    log::info!("Interrupted with {} active connections, shutting down", self.active);
                    self.shutdown();
                    return Ok(Exit::Interrupted);
                }
                Err(e) => {
                    log::error!("Wait failed: {e}");
                    self.shutdown();
                    return Err(e);
                }
            }

            let batch = std::mem::take(&mut self.batch);
            let dispatched = batch.iter().try_for_each(|event| self.dispatch(*event));
            self.batch = batch;
            if let Err(e) = dispatched {
                log::error!("Fatal error, shutting down: {e}");
                self.shutdown();
                return Err(e);
            }
        }
        log::info!("All connections closed");
        Ok(Exit::Completed)
    }

    fn dispatch(&mut self, event: Readiness) -> FeedResult<()> {
        let handle = Handle::from_key(event.key);
        let policy = self.config.ack;
        let Some(record) = self.connections.get_mut(handle) else {
            log::trace!("Event for retired key {:#x}", event.key);
            return Ok(());
        };

        let mut result = Ok(Progress::Open);
        if event.readable {
            result = record.on_readable(policy);
        }
        if event.writable && matches!(result, Ok(Progress::Open)) {
            result = record.on_writable(policy);
        }

        match result {
            Ok(Progress::Open) => Ok(()),
            Ok(Progress::Closed(reason)) => self.retire(handle, reason),
            Err(e) if e.is_connection_fatal() => {
                log::error!("Connection {handle} failed: {e}");
                let reason = record.fail();
                self.retire(handle, reason)
            }
            Err(e) => Err(e),
        }
    }

    /// Deregisters, closes and forgets a connection in `Closed` state.
    fn retire(&mut self, handle: Handle, reason: CloseReason) -> FeedResult<()> {
        let Some(record) = self.connections.get(handle) else {
            return Ok(());
        };
        self.mux.unwatch(record.channel())?;
        if let Some(record) = self.connections.remove(handle) {
            self.outcomes.push(Outcome {
                handle,
                reason,
                bytes_sent: record.bytes_sent(),
                bytes_received: record.bytes_received(),
            });
            // dropping the record closes the channel and the source
            drop(record);
        }
        self.active = self.active.saturating_sub(1);
        log::debug!("Connection {handle} closed ({reason:?}), {} active", self.active);
        Ok(())
    }

    /// Releases every remaining connection in insertion order.
    ///
    /// Safe to call any number of times.
    pub fn shutdown(&mut self) {
        let mux = &mut self.mux;
        self.connections.for_each(|handle, record| {
            if let Err(e) = mux.unwatch(record.channel()) {
                log::warn!("Releasing {handle}: {e}");
            }
            record.fail();
        });
        // dropping the records closes their channels and sources
        drop(self.connections.drain());
        self.active = 0;
    }
}

impl<C: Channel + AsFd, S: Read> Drop for Engine<C, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
