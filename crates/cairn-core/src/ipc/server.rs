//! Unix-socket server exposing the routing manager to other processes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::FrameCodec;
use super::protocol::{Request, Response, PROTOCOL_VERSION};
use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::routing::RoutingManager;

type ServerFramed = Framed<UnixStream, FrameCodec<Request, Response>>;

/// Server bound to a filesystem socket
#[derive(Debug)]
pub struct RoutingServer {
    manager: Arc<RoutingManager>,
    listener: UnixListener,
    socket_path: PathBuf,
    settings: ServerSettings,
}

impl RoutingServer {
    /// Bind the socket, replacing a stale socket file left by a dead server
    pub fn bind(
        manager: Arc<RoutingManager>,
        socket_path: impl Into<PathBuf>,
        settings: ServerSettings,
    ) -> Result<Self> {
        let socket_path = socket_path.into();

        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
                return Err(Error::InvalidInput(format!(
                    "socket {} is already served by another process",
                    socket_path.display()
                )));
            }
            std::fs::remove_file(&socket_path)?;
            debug!(path = %socket_path.display(), "Removed stale socket");
        }
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "Routing server listening");

        Ok(Self {
            manager,
            listener,
            socket_path,
            settings,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Open connections are closed, waited for, and the socket file is
    /// removed before this returns.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.settings.max_connections.max(1)));
        let mut connections = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "Connection task failed");
                    }
                }
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let permit = match limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                max_connections = self.settings.max_connections,
                                "Connection limit reached, rejecting client"
                            );
                            continue;
                        }
                    };

                    next_id += 1;
                    connections.spawn(handle_connection(
                        next_id,
                        self.manager.clone(),
                        stream,
                        self.settings.clone(),
                        shutdown.child_token(),
                        permit,
                    ));
                }
            }
        }

        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "Connection task failed");
            }
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Socket file already gone");
        }
        info!("Routing server stopped");
        Ok(())
    }
}

async fn handle_connection(
    conn_id: u64,
    manager: Arc<RoutingManager>,
    stream: UnixStream,
    settings: ServerSettings,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let mut framed: ServerFramed = Framed::new(stream, FrameCodec::new());
    let io_timeout = settings.io_timeout();
    let idle_timeout = settings.idle_timeout();
    let mut idle = Duration::ZERO;

    debug!(conn_id = conn_id, "Client connected");

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = timeout(io_timeout, framed.next()) => next,
        };

        let request = match next {
            Err(_) => {
                if !framed.read_buffer().is_empty() {
                    let err = Error::ConnectionTimeout(io_timeout);
                    warn!(conn_id = conn_id, error = %err, "Discarding partial frame");
                    break;
                }
                idle += io_timeout;
                if idle >= idle_timeout {
                    debug!(conn_id = conn_id, "Closing idle connection");
                    break;
                }
                continue;
            }
            Ok(None) => {
                debug!(conn_id = conn_id, "Client disconnected");
                break;
            }
            Ok(Some(Err(Error::Io(e)))) => {
                debug!(conn_id = conn_id, error = %e, "Connection lost");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(conn_id = conn_id, error = %e, "Protocol error, closing connection");
                let _ = timeout(io_timeout, framed.send(Response::from(&e))).await;
                break;
            }
            Ok(Some(Ok(request))) => {
                idle = Duration::ZERO;
                request
            }
        };

        let response = dispatch(&manager, request);
        match timeout(io_timeout, framed.send(response)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = conn_id, error = %e, "Failed to write response");
                break;
            }
            Err(_) => {
                warn!(conn_id = conn_id, "Response write timed out");
                break;
            }
        }
    }
}

/// Answer one request using the manager
fn dispatch(manager: &RoutingManager, request: Request) -> Response {
    match request {
        Request::SelectBackend {
            content,
            strategy,
            priority,
            available,
        } => match manager.route(&content.into(), strategy, priority, available.as_deref()) {
            Ok(decision) => Response::Selected {
                backend_id: decision.backend_id,
                score: decision.score,
                decision_id: decision.id,
            },
            Err(e) => {
                debug!(error = %e, "Selection request failed");
                Response::from(&e)
            }
        },
        Request::RecordOutcome {
            backend_id,
            content,
            success,
            duration_ms,
        } => {
            manager.record_routing_outcome(&backend_id, &content.into(), success, duration_ms);
            Response::Ack
        }
        Request::Ping => Response::Pong {
            version: PROTOCOL_VERSION,
        },
    }
}
