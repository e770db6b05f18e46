//! Acceptor and echo sink for feed clients.
//!
//! The server accepts connections on a non-blocking listener, drains every
//! peer to `WouldBlock`, and copies what it receives into a sink. When a
//! peer half-closes after sending something, the server answers with
//! [`ACK_TOKEN`] and closes the connection.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use crate::config::ServerConfig;
use crate::connection::{ACK_TOKEN, zeroed_buffer};
use crate::engine::Exit;
use crate::error::{FeedError, FeedResult};
use crate::mux::{Interest, Multiplexer, Readiness, Wait};
use crate::registry::{Handle, Registry};

/// Readiness key of the listening socket.
const LISTENER_KEY: usize = usize::MAX - 1;

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    received: u64,
}

enum PeerState {
    Open,
    Finished,
}

/// Single-threaded acceptor that sinks what feed clients send.
pub struct FeedServer<W: Write> {
    listener: TcpListener,
    mux: Multiplexer,
    peers: Registry<Peer>,
    sink: W,
    config: ServerConfig,
    buffer: Box<[u8]>,
    batch: Vec<Readiness>,
    finished: usize,
}

impl<W: Write> FeedServer<W> {
    /// Binds the listener and starts watching it.
    pub fn bind<A: ToSocketAddrs>(addr: A, sink: W, config: ServerConfig) -> FeedResult<Self> {
        config.validate()?;
        let buffer = zeroed_buffer(config.buffer_capacity)?;
        let listener = TcpListener::bind(addr).map_err(FeedError::SystemResource)?;
        listener
            .set_nonblocking(true)
            .map_err(FeedError::SystemResource)?;
        let mut mux = Multiplexer::new(config.max_batch)?;
        mux.watch(&listener, Interest::READABLE, LISTENER_KEY)?;
        log::info!(
            "Listening on {:?}",
            listener.local_addr().map_err(FeedError::SystemResource)?
        );
        Ok(FeedServer {
            listener,
            mux,
            peers: Registry::new(),
            sink,
            buffer,
            batch: Vec::with_capacity(config.max_batch),
            config,
            finished: 0,
        })
    }

    /// Returns the local address that this server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Routes `signals` to the server's wait.
    pub fn interrupt_on(&mut self, signals: &[i32]) -> FeedResult<()> {
        self.mux.interrupt_on(signals)
    }

    /// Number of peers served to completion so far.
    pub fn finished(&self) -> usize {
        self.finished
    }

    /// Returns the sink received bytes are written to.
    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Serves peers until interrupted, or until `limit` peers have finished.
    pub fn serve(&mut self, limit: Option<usize>) -> FeedResult<Exit> {
        loop {
            if limit.is_some_and(|limit| self.finished >= limit) {
                self.shutdown();
                return Ok(Exit::Completed);
            }
            match self.mux.wait(&mut self.batch) {
                Ok(Wait::Ready) => {}
                Ok(Wait::Interrupted) => {
                    log::info!("Shutting down...");
                    self.shutdown();
                    return Ok(Exit::Interrupted);
                }
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }

            let batch = std::mem::take(&mut self.batch);
            let handled = batch.iter().try_for_each(|event| {
                if event.key == LISTENER_KEY {
                    self.accept_all()
                } else {
                    self.serve_peer(Handle::from_key(event.key))
                }
            });
            self.batch = batch;
            if let Err(e) = handled {
                self.shutdown();
                return Err(e);
            }
        }
    }

    fn accept_all(&mut self) -> FeedResult<()> {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(FeedError::SystemResource(e)),
            };
            log::debug!("Accepted connection from: {addr}");
            self.admit(stream, addr)?;
        }
    }

    /// Tracks and watches an accepted peer. A peer that cannot be watched is
    /// dropped again.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> FeedResult<Handle> {
        stream
            .set_nonblocking(true)
            .map_err(FeedError::SystemResource)?;
        let handle = self.peers.insert(Peer {
            stream,
            addr,
            received: 0,
        })?;
        let Some(peer) = self.peers.get(handle) else {
            return Err(FeedError::ProtocolViolation(format!(
                "peer {handle} vanished after insertion"
            )));
        };
        if let Err(e) = self.mux.watch(&peer.stream, Interest::READABLE, handle.key()) {
            self.peers.remove(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn serve_peer(&mut self, handle: Handle) -> FeedResult<()> {
        let Some(peer) = self.peers.get_mut(handle) else {
            return Ok(());
        };
        let state = drain_peer(peer, &mut self.buffer, &mut self.sink, self.config.send_ack);
        match state {
            PeerState::Open => Ok(()),
            PeerState::Finished => {
                if let Some(peer) = self.peers.get(handle) {
                    self.mux.unwatch(&peer.stream)?;
                }
                if let Some(peer) = self.peers.remove(handle) {
                    log::debug!("Closed {} after {} bytes", peer.addr, peer.received);
                }
                self.finished += 1;
                Ok(())
            }
        }
    }

    /// Releases every peer. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        for (_, peer) in self.peers.drain() {
            if let Err(e) = self.mux.unwatch(&peer.stream) {
                log::warn!("Releasing {}: {e}", peer.addr);
            }
        }
        if self.mux.is_watched(&self.listener) {
            if let Err(e) = self.mux.unwatch(&self.listener) {
                log::warn!("Releasing listener: {e}");
            }
        }
    }
}

impl<W: Write> Drop for FeedServer<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_peer<W: Write>(peer: &mut Peer, buffer: &mut [u8], sink: &mut W, send_ack: bool) -> PeerState {
    loop {
        match peer.stream.read(buffer) {
            Ok(0) => {
                // orderly shutdown
                if send_ack && peer.received > 0 {
                    match peer.stream.write(ACK_TOKEN) {
                        Ok(n) if n == ACK_TOKEN.len() => log::debug!("Acknowledged {}", peer.addr),
                        Ok(n) => log::warn!("Partial acknowledgment to {}: {n} bytes", peer.addr),
                        Err(e) => log::warn!("Cannot acknowledge {}: {e}", peer.addr),
                    }
                }
                return PeerState::Finished;
            }
            Ok(n) => {
                peer.received += n as u64;
                if let Err(e) = sink.write_all(&buffer[..n]) {
                    log::error!("Sink write failed: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Err(e) = sink.flush() {
                    log::error!("Sink flush failed: {e}");
                }
                return PeerState::Open;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("Socket recv error from {}: {e}", peer.addr);
                return PeerState::Finished;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Shutdown;
    use std::thread;

    #[test]
    fn echoes_and_acknowledges_one_peer() {
        let mut server = FeedServer::bind("127.0.0.1:0", Vec::new(), ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello server").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        });

        assert_eq!(server.serve(Some(1)).unwrap(), Exit::Completed);
        assert_eq!(server.sink(), b"hello server");
        assert_eq!(client.join().unwrap(), ACK_TOKEN);
    }

    #[test]
    fn silent_peer_is_not_acknowledged() {
        let mut server = FeedServer::bind("127.0.0.1:0", Vec::new(), ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        });

        server.serve(Some(1)).unwrap();
        assert!(server.sink().is_empty());
        assert!(client.join().unwrap().is_empty());
    }

    #[test]
    fn ack_can_be_disabled() {
        let config = ServerConfig {
            send_ack: false,
            ..ServerConfig::default()
        };
        let mut server = FeedServer::bind("127.0.0.1:0", Vec::new(), config).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"data").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).unwrap();
            reply
        });

        server.serve(Some(1)).unwrap();
        assert_eq!(server.finished(), 1);
        assert!(client.join().unwrap().is_empty());
    }

    #[test]
    fn peer_that_cannot_be_watched_is_not_kept() {
        let mut server = FeedServer::bind("127.0.0.1:0", Vec::new(), ServerConfig::default()).unwrap();
        let addr = server.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        server.listener.set_nonblocking(false).unwrap();
        let (stream, peer_addr) = server.listener.accept().unwrap();

        // the descriptor is already watched, so admitting it must fail
        server.mux.watch(&stream, Interest::READABLE, 5).unwrap();
        assert!(matches!(
            server.admit(stream, peer_addr),
            Err(FeedError::Registration(_))
        ));
        assert!(server.peers.is_empty());
    }

    #[test]
    fn oversized_receive_buffer_is_resource_exhaustion() {
        let config = ServerConfig {
            buffer_capacity: usize::MAX / 4,
            ..ServerConfig::default()
        };
        assert!(matches!(
            FeedServer::bind("127.0.0.1:0", Vec::new(), config),
            Err(FeedError::ResourceExhausted(_))
        ));
    }
}
