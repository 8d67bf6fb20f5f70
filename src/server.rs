//! Controller-facing TCP server.
//!
//! One thread per connection, requests handled in arrival order. The core
//! sits behind a mutex; dumps additionally hold the dump lock so shutdown
//! can wait for an in-flight dump to finish.

use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::core::SnifferCore;
use crate::protocol::{self, Request};
use crate::transport::SocketTransport;

/// How long blocking calls wait before re-checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Listen backlog for controller connections.
const LISTEN_BACKLOG: i32 = 16;

pub struct ControlServer {
    /// Bind address.
    bind_addr: SocketAddr,
    /// The sniffer manager.
    core: Arc<Mutex<SnifferCore>>,
    /// Held for the whole of each dump.
    dump_lock: Arc<Mutex<()>>,
    /// Running flag.
    running: Arc<AtomicBool>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| anyhow!("{} lock poisoned", what))
}

impl ControlServer {
    pub fn new(core: SnifferCore, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            core: Arc::new(Mutex::new(core)),
            dump_lock: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a handle to stop the server.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn core(&self) -> Arc<Mutex<SnifferCore>> {
        self.core.clone()
    }

    /// Create the listening socket.
    pub fn bind(&self) -> Result<TcpListener> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .context("Failed to create socket")?;

        socket.set_reuse_address(true)?;
        socket
            .bind(&self.bind_addr.into())
            .with_context(|| format!("Failed to bind to {}", self.bind_addr))?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        Ok(socket.into())
    }

    /// Bind and serve until the running flag is cleared, then shut the
    /// core down.
    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener)
    }

    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Sniffer control server listening on {}",
            listener.local_addr().unwrap_or(self.bind_addr)
        );
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!("Controller connected from {}", peer);
                    let core = self.core.clone();
                    let dump_lock = self.dump_lock.clone();
                    let running = self.running.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, core, dump_lock, running) {
                            error!("Controller connection {} failed: {:#}", peer, e);
                        }
                        debug!("Controller {} disconnected", peer);
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        self.shutdown()?;
        info!("Sniffer control server stopped");
        Ok(())
    }

    /// Wait for a running dump, then stop all sniffers and clean up.
    pub fn shutdown(&self) -> Result<()> {
        let _dump = lock(&self.dump_lock, "dump")?;
        let mut core = lock(&self.core, "core")?;
        core.shutdown();
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    core: Arc<Mutex<SnifferCore>>,
    dump_lock: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut reader = BufReader::new(stream.try_clone().context("Failed to clone stream")?);
    let mut transport = SocketTransport::new(stream);
    let mut line = String::new();

    while running.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if !line.trim().is_empty() {
                    match line.parse::<Request>() {
                        Ok(request) => {
                            let _dump = if request.is_dump() {
                                Some(lock(&dump_lock, "dump")?)
                            } else {
                                None
                            };
                            let mut core = lock(&core, "core")?;
                            protocol::execute(&mut core, &request, &mut transport)?;
                        }
                        Err(e) => protocol::reject(&e, &mut transport)?,
                    }
                }
                line.clear();
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                warn!("Controller read error: {}", e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}
