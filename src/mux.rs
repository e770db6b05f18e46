//! Edge-triggered readiness multiplexer.
//!
//! [`Multiplexer`] wraps a [`polling::Poller`] and registers every channel in
//! [`PollMode::Edge`]. A notification is delivered once per readiness
//! transition, so whoever handles an event has to read (or write) until the
//! channel reports `WouldBlock`; otherwise the channel goes quiet for good.
//!
//! Signals are turned into readiness too: [`Multiplexer::interrupt_on`]
//! installs handlers that write into a self-pipe watched under
//! [`SIGNAL_KEY`], and [`Multiplexer::wait`] reports that as
//! [`Wait::Interrupted`].

use std::collections::HashMap;
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use polling::{Event, Events, PollMode, Poller};
use signal_hook::SigId;

use crate::error::{FeedError, FeedResult};

/// Key of the signal self-pipe. Lies in the index range a registry never
/// hands out; `polling` itself reserves `usize::MAX`.
pub const SIGNAL_KEY: usize = usize::MAX - 2;

/// Interest flags for I/O readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Interest in both readable and writable events.
    pub const fn both() -> Self {
        Interest(0b11)
    }

    /// Returns true if readable interest is set.
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    fn to_event(self, key: usize) -> Event {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// One entry of a wait batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The key given to [`Multiplexer::watch`].
    pub key: usize,
    /// The channel can be read without blocking.
    pub readable: bool,
    /// The channel can be written without blocking.
    pub writable: bool,
}

/// Result of a [`Multiplexer::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The batch holds the events delivered by the poller. It may be empty.
    Ready,
    /// A watched signal arrived. The rest of the batch was discarded.
    Interrupted,
}

/// Edge-triggered wrapper around the OS readiness facility.
pub struct Multiplexer {
    poller: Poller,
    events: Events,
    watched: HashMap<RawFd, usize>,
    signal_pipe: Option<UnixStream>,
    signal_ids: Vec<SigId>,
}

impl Multiplexer {
    /// Creates the poller. `max_batch` bounds the events returned per wait.
    pub fn new(max_batch: usize) -> FeedResult<Self> {
        let capacity = NonZeroUsize::new(max_batch)
            .ok_or_else(|| FeedError::InvalidConfig("batch size must be non-zero".into()))?;
        let poller = Poller::new().map_err(FeedError::SystemResource)?;
        if !poller.supports_edge() {
            return Err(FeedError::SystemResource(io::Error::new(
                io::ErrorKind::Unsupported,
                "poller does not support edge-triggered mode",
            )));
        }
        Ok(Multiplexer {
            poller,
            events: Events::with_capacity(capacity),
            watched: HashMap::new(),
            signal_pipe: None,
            signal_ids: Vec::new(),
        })
    }

    /// Starts watching `source` for `interest` and tags its events with `key`.
    ///
    /// The caller must [`unwatch`](Self::unwatch) the source before closing it.
    pub fn watch<S: AsFd>(&mut self, source: &S, interest: Interest, key: usize) -> FeedResult<()> {
        let fd = source.as_fd().as_raw_fd();
        if key == SIGNAL_KEY {
            return Err(FeedError::Registration(io::Error::new(
                io::ErrorKind::InvalidInput,
                "key is reserved for signal delivery",
            )));
        }
        if self.watched.contains_key(&fd) {
            return Err(FeedError::Registration(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already watched"),
            )));
        }
        // SAFETY: every watched descriptor is removed through unwatch() before
        // the object owning it is dropped.
        unsafe {
            self.poller
                .add_with_mode(fd, interest.to_event(key), PollMode::Edge)
                .map_err(FeedError::Registration)?;
        }
        self.watched.insert(fd, key);
        log::debug!("Watching fd {fd} with key {key:#x} for {interest:?}");
        Ok(())
    }

    /// Stops watching `source`. Fails if it was never watched.
    pub fn unwatch<S: AsFd>(&mut self, source: &S) -> FeedResult<()> {
        let fd = source.as_fd();
        let raw = fd.as_raw_fd();
        if !self.watched.contains_key(&raw) {
            return Err(FeedError::Registration(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {raw} is not watched"),
            )));
        }
        self.poller.delete(fd).map_err(FeedError::Registration)?;
        self.watched.remove(&raw);
        log::debug!("Stopped watching fd {raw}");
        Ok(())
    }

    /// True if `source` is currently watched.
    pub fn is_watched<S: AsFd>(&self, source: &S) -> bool {
        self.watched.contains_key(&source.as_fd().as_raw_fd())
    }

    /// Number of watched channels, not counting the signal pipe.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Routes `signals` to this multiplexer so that a blocked
    /// [`wait`](Self::wait) returns [`Wait::Interrupted`].
    pub fn interrupt_on(&mut self, signals: &[i32]) -> FeedResult<()> {
        if signals.is_empty() {
            return Ok(());
        }
        if self.signal_pipe.is_some() {
            return Err(FeedError::Registration(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "signal delivery is already configured",
            )));
        }

        let (reader, writer) = UnixStream::pair().map_err(FeedError::SystemResource)?;
        reader.set_nonblocking(true).map_err(FeedError::SystemResource)?;
        writer.set_nonblocking(true).map_err(FeedError::SystemResource)?;
        // SAFETY: the reader lives in self.signal_pipe and is deleted from
        // the poller in Drop before it is closed.
        unsafe {
            self.poller
                .add_with_mode(reader.as_raw_fd(), Event::readable(SIGNAL_KEY), PollMode::Edge)
                .map_err(FeedError::Registration)?;
        }
        self.signal_pipe = Some(reader);

        // each handler owns a writer; the reader sees EOF once the last one is gone
        for &signal in signals {
            let pipe = writer.try_clone().map_err(FeedError::SystemResource)?;
            let id = signal_hook::low_level::pipe::register(signal, pipe)
                .map_err(FeedError::SystemResource)?;
            self.signal_ids.push(id);
        }
        Ok(())
    }

    /// Blocks until at least one watched channel is ready or a signal
    /// arrives, and fills `batch` with the ready channels.
    ///
    /// There is no timeout.
    pub fn wait(&mut self, batch: &mut Vec<Readiness>) -> FeedResult<Wait> {
        batch.clear();
        self.events.clear();
        match self.poller.wait(&mut self.events, None) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Wait::Interrupted),
            Err(e) => return Err(FeedError::SystemResource(e)),
        }

        let mut interrupted = false;
        for event in self.events.iter() {
            if event.key == SIGNAL_KEY {
                interrupted = true;
                continue;
            }
            batch.push(Readiness {
                key: event.key,
                readable: event.readable,
                writable: event.writable,
            });
        }

        if interrupted {
            self.drain_signal_pipe();
            batch.clear();
            return Ok(Wait::Interrupted);
        }
        log::trace!("Wait returned {} events", batch.len());
        Ok(Wait::Ready)
    }

    fn drain_signal_pipe(&mut self) {
        let Some(pipe) = self.signal_pipe.as_mut() else {
            return;
        };
        let mut buf = [0u8; 32];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        if let Some(pipe) = self.signal_pipe.take() {
            let _ = self.poller.delete(&pipe);
        }
        if !self.watched.is_empty() {
            log::warn!("Multiplexer dropped with {} watched channels", self.watched.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn duplicate_watch_is_rejected() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (a, _b) = pair();
        mux.watch(&a, Interest::READABLE, 1).unwrap();
        assert!(matches!(
            mux.watch(&a, Interest::READABLE, 2),
            Err(FeedError::Registration(_))
        ));
        mux.unwatch(&a).unwrap();
    }

    #[test]
    fn unwatch_of_unknown_channel_is_rejected() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (a, _b) = pair();
        assert!(matches!(mux.unwatch(&a), Err(FeedError::Registration(_))));
    }

    #[test]
    fn signal_key_cannot_be_used_by_channels() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (a, _b) = pair();
        assert!(mux.watch(&a, Interest::READABLE, SIGNAL_KEY).is_err());
        assert_eq!(mux.watched_count(), 0);
    }

    #[test]
    fn reports_readable_and_writable_with_key() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (a, mut b) = pair();
        b.write_all(b"ping").unwrap();
        mux.watch(&a, Interest::both(), 7).unwrap();

        let mut batch = Vec::new();
        assert_eq!(mux.wait(&mut batch).unwrap(), Wait::Ready);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, 7);
        assert!(batch[0].readable);
        assert!(batch[0].writable);
        mux.unwatch(&a).unwrap();
        assert!(!mux.is_watched(&a));
    }

    #[test]
    fn edge_fires_again_for_new_data_after_drain() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (mut a, mut b) = pair();
        mux.watch(&a, Interest::READABLE, 3).unwrap();

        let mut batch = Vec::new();
        b.write_all(b"one").unwrap();
        mux.wait(&mut batch).unwrap();
        assert_eq!(batch.len(), 1);
        let mut buf = [0u8; 16];
        assert_eq!(a.read(&mut buf).unwrap(), 3);
        assert_eq!(
            a.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        b.write_all(b"two").unwrap();
        mux.wait(&mut batch).unwrap();
        assert_eq!(batch, vec![Readiness { key: 3, readable: true, writable: false }]);
        mux.unwatch(&a).unwrap();
    }

    #[test]
    fn signal_interrupts_wait() {
        let mut mux = Multiplexer::new(4).unwrap();
        mux.interrupt_on(&[signal_hook::consts::SIGUSR1]).unwrap();
        assert!(mux.interrupt_on(&[signal_hook::consts::SIGUSR1]).is_err());
        signal_hook::low_level::raise(signal_hook::consts::SIGUSR1).unwrap();

        let mut batch = Vec::new();
        assert_eq!(mux.wait(&mut batch).unwrap(), Wait::Interrupted);
        assert!(batch.is_empty());
    }

    #[test]
    fn empty_signal_list_configures_nothing() {
        let mut mux = Multiplexer::new(4).unwrap();
        mux.interrupt_on(&[]).unwrap();
        assert!(mux.signal_pipe.is_none());
    }

    #[test]
    fn signal_key_is_outside_handle_space() {
        use crate::registry::Handle;
        assert_ne!(SIGNAL_KEY, usize::MAX);
        let mut registry = crate::registry::Registry::new();
        registry.insert(()).unwrap();
        assert!(!registry.contains(Handle::from_key(SIGNAL_KEY)));
    }

    #[test]
    fn unwatch_keeps_bookkeeping_in_step_with_poller() {
        let mut mux = Multiplexer::new(4).unwrap();
        let (a, _b) = pair();
        mux.watch(&a, Interest::READABLE, 9).unwrap();
        mux.unwatch(&a).unwrap();
        assert!(!mux.is_watched(&a));
        assert!(mux.unwatch(&a).is_err());
        // re-registering works because both sides forgot the descriptor
        mux.watch(&a, Interest::READABLE, 9).unwrap();
        mux.unwatch(&a).unwrap();
    }
}
