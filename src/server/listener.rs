//! Control server: listener setup and the accept loop.

use std::sync::Arc;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::service::{ControlService, HitHandler};
use crate::config::ListenType;
use crate::error::{FencerError, Result};

/// A bound control socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind the socket described by the configuration.
    ///
    /// A TCP address of the form `:port` listens on every interface. For a
    /// Unix socket, a stale socket file at `addr` is removed first.
    pub async fn bind(listen_type: ListenType, addr: &str) -> Result<Self> {
        match listen_type {
            ListenType::Tcp => {
                let addr = if addr.starts_with(':') {
                    format!("0.0.0.0{}", addr)
                } else {
                    addr.to_string()
                };
                Ok(Listener::Tcp(TcpListener::bind(&addr).await?))
            }
            #[cfg(unix)]
            ListenType::Unix => {
                match std::fs::remove_file(addr) {
                    Ok(()) => debug!(path = %addr, "Removed stale socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(FencerError::Io(e)),
                }
                Ok(Listener::Unix(UnixListener::bind(addr)?))
            }
            #[cfg(not(unix))]
            ListenType::Unix => Err(FencerError::Config(
                "unix sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// Human-readable local address.
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            #[cfg(unix)]
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unnamed>".to_string()),
        }
    }
}

/// Accepts control connections and serves each on its own task.
pub struct ControlServer<H: HitHandler + 'static> {
    service: ControlService<H>,
    /// Permits for concurrently served connections, unlimited when `None`
    slots: Option<Arc<Semaphore>>,
}

impl<H: HitHandler + 'static> ControlServer<H> {
    pub fn new(handler: Arc<H>, max_connections: Option<usize>) -> Self {
        Self {
            service: ControlService::new(handler),
            slots: max_connections.map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Connections beyond `max_connections` are dropped immediately.
    pub async fn serve(&self, listener: Listener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %listener.local_addr(), "Control server listening");

        loop {
            let accepted = tokio::select! {
                res = accept(&listener) => res,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping accept loop");
                        break;
                    }
                    continue;
                }
            };

            let (conn, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let permit = match &self.slots {
                Some(slots) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(peer = %peer, "Connection limit reached, dropping");
                        continue;
                    }
                },
                None => None,
            };

            debug!(peer = %peer, "Accepted connection");
            let service = self.service.clone();
            tokio::spawn(async move {
                let result = match conn {
                    Connection::Tcp(stream) => service.serve(stream).await,
                    #[cfg(unix)]
                    Connection::Unix(stream) => service.serve(stream).await,
                };
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Closing connection");
                }
                drop(permit);
            });
        }

        Ok(())
    }
}

enum Connection {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> std::io::Result<(Connection, String)> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "Failed to set TCP_NODELAY");
            }
            Ok((Connection::Tcp(stream), addr.to_string()))
        }
        #[cfg(unix)]
        Listener::Unix(l) => {
            let (stream, _) = l.accept().await?;
            Ok((Connection::Unix(stream), "unix".to_string()))
        }
    }
}
