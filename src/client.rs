use std::fs::File;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::engine::{Engine, Exit, Outcome};
use crate::error::{FeedError, FeedResult};
use crate::registry::Handle;

/// Streams a set of local files to one server, one TCP connection per file.
pub struct FeedClient {
    engine: Engine<TcpStream, File>,
    files: Vec<(Handle, PathBuf)>,
    skipped: Vec<PathBuf>,
}

impl FeedClient {
    /// Opens every path and connects one stream per opened file.
    ///
    /// Paths that cannot be opened are skipped. A failed connect aborts the
    /// whole client; connections made so far are released.
    pub fn connect<P: AsRef<Path>>(
        addr: SocketAddr,
        paths: &[P],
        config: EngineConfig,
    ) -> FeedResult<FeedClient> {
        let mut engine = Engine::new(config)?;
        let mut files = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            let path = path.as_ref();
            let file = match File::open(path) {
                Ok(file) => file,
                Err(e) => {
                    log::debug!("Skipping {}: {e}", path.display());
                    skipped.push(path.to_path_buf());
                    continue;
                }
            };
            let stream =
                TcpStream::connect(addr).map_err(|source| FeedError::Connect { addr, source })?;
            log::debug!("Connected {} to {addr}", path.display());
            let handle = engine.add(stream, file)?;
            files.push((handle, path.to_path_buf()));
        }

        Ok(FeedClient {
            engine,
            files,
            skipped,
        })
    }

    /// Routes `signals` to the engine's wait.
    pub fn interrupt_on(&mut self, signals: &[i32]) -> FeedResult<()> {
        self.engine.interrupt_on(signals)
    }

    /// Runs the engine until every connection is closed or a signal arrives.
    pub fn run(&mut self) -> FeedResult<Exit> {
        self.engine.run()
    }

    /// Files that got a connection, in connection order.
    pub fn files(&self) -> &[(Handle, PathBuf)] {
        &self.files
    }

    /// Paths that could not be opened.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Terminal outcome of every closed connection.
    pub fn outcomes(&self) -> &[Outcome] {
        self.engine.outcomes()
    }

    /// Number of connections that have not reached `Closed`.
    pub fn active_count(&self) -> usize {
        self.engine.active_count()
    }
}
