//! Local TCP service accepting one connection per client process.

mod connection;
pub mod port_file;

pub use port_file::{parse_port_file, read_port_file, write_port_file};

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::stream::{StreamMux, StreamServices};
use connection::Connection;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("failed to write port file {path}: {source}")]
    PortFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
}

/// State shared by the accept loop and every connection.
pub(crate) struct ServerShared {
    pub(crate) settings: Settings,
    pub(crate) services: StreamServices,
    pub(crate) mux: StreamMux,
    /// Fired once a client (or the host process) asks for teardown.
    pub(crate) teardown: CancelToken,
    stopping: CancelToken,
    connections: Mutex<Vec<ConnectionSlot>>,
}

struct ConnectionSlot {
    id: String,
    socket: TcpStream,
    handle: JoinHandle<()>,
}

pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn bind(settings: Settings, services: StreamServices) -> Result<Self, ServerError> {
        let addr = SocketAddr::new(settings.listen_host, settings.port);
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        tracing::info!(addr = %local_addr, "server: listening");
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shared: Arc::new(ServerShared {
                settings,
                services,
                mux: StreamMux::new(),
                teardown: CancelToken::new(),
                stopping: CancelToken::new(),
                connections: Mutex::new(Vec::new()),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn write_port_file(&self, path: &Path) -> Result<(), ServerError> {
        write_port_file(path, self.local_addr.port())?;
        tracing::info!(path = %path.display(), port = self.local_addr.port(), "server: wrote port file");
        Ok(())
    }

    /// Cancel to request teardown; [`Server::close`] waits for it.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shared.teardown.clone()
    }

    pub fn mux(&self) -> &StreamMux {
        &self.shared.mux
    }

    /// Spawns the accept loop.
    pub fn start(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("server-accept".to_string())
            .spawn(move || accept_loop(listener, shared))
            .map_err(|source| ServerError::Spawn {
                worker: "accept",
                source,
            })?;
        *self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Blocks until teardown is requested, then stops accepting, finishes
    /// remaining streams and joins every connection thread.
    pub fn close(&self) {
        self.shared.teardown.wait();
        tracing::info!("server: closing");
        self.stop_accepting();

        self.shared
            .mux
            .finish_and_close_all(0, self.shared.settings.shutdown_timeout());

        let connections = std::mem::take(
            &mut *self
                .shared
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for slot in connections {
            let _ = slot.socket.shutdown(std::net::Shutdown::Both);
            if slot.handle.join().is_err() {
                tracing::error!(connection_id = %slot.id, "server: connection thread panicked");
            }
        }
        tracing::info!("server: closed");
    }

    fn stop_accepting(&self) {
        self.shared.stopping.cancel();
        let accept_thread = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(accept_thread) = accept_thread else {
            return;
        };
        // The accept loop is blocked in accept(); a throwaway connection
        // lets it observe `stopping`.
        if let Err(err) = TcpStream::connect(wake_addr(self.local_addr)) {
            tracing::warn!(error = %err, "server: failed to wake accept loop");
        }
        if accept_thread.join().is_err() {
            tracing::error!("server: accept thread panicked");
        }
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    for incoming in listener.incoming() {
        if shared.stopping.is_canceled() {
            break;
        }
        match incoming {
            Ok(socket) => spawn_connection(&shared, socket),
            Err(err) => tracing::warn!(error = %err, "server: accept failed"),
        }
    }
    tracing::debug!("server: accept loop finished");
}

fn spawn_connection(shared: &Arc<ServerShared>, socket: TcpStream) {
    let control = match socket.try_clone() {
        Ok(control) => control,
        Err(err) => {
            tracing::warn!(error = %err, "server: failed to clone accepted socket");
            return;
        }
    };
    let connection = Connection::new(Arc::clone(shared));
    let id = connection.id().to_string();
    let spawned = thread::Builder::new()
        .name("server-conn".to_string())
        .spawn(move || connection.run(socket));
    let handle = match spawned {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(connection_id = %id, error = %err, "server: failed to spawn connection");
            return;
        }
    };

    let mut connections = shared
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    connections.retain(|slot| !slot.handle.is_finished());
    connections.push(ConnectionSlot {
        id,
        socket: control,
        handle,
    });
}
