//! Named local-socket endpoints.
//!
//! The daemon publishes two Unix-domain listeners with world-accessible
//! modes: control for command clients and monitor for the action-draining
//! monitor. Each accepted connection gets one task that owns the read
//! buffer, reassembles secure frames by their declared length, pushes
//! them through the session gate and the dispatcher, and writes replies
//! back in order. Anything the framing or session layers reject is
//! dropped without a response.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use patrol_core::framing::SecureCodec;
use patrol_core::session::SessionHandle;
use patrol_core::{SessionTable, SharedSecret};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::framing::FrameCodec;

/// Which endpoint a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Command clients.
    Control,
    /// Action-draining monitor clients.
    Monitor,
}

impl EndpointKind {
    /// Display name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Monitor => "monitor",
        }
    }

    /// Maximum simultaneous clients.
    #[must_use]
    pub fn max_clients(self) -> usize {
        match self {
            Self::Control => 5,
            Self::Monitor => 10,
        }
    }
}

/// State shared by both endpoints and all connection tasks.
pub struct EndpointShared {
    /// Server-side secure codec.
    pub codec: SecureCodec,
    /// The machine shared secret for the auth round-trip.
    pub secret: SharedSecret,
    /// The request dispatcher.
    pub dispatcher: Dispatcher,
    /// Live sessions across both endpoints.
    pub sessions: SessionTable,
}

/// A bound, not yet serving endpoint.
///
/// Binding is separate from serving so listener failures are fatal at
/// startup instead of surfacing after the daemon reports itself running.
pub struct BoundEndpoint {
    kind: EndpointKind,
    path: PathBuf,
    listener: UnixListener,
}

impl BoundEndpoint {
    /// Binds the socket at `path` with a world-accessible mode.
    pub fn bind(kind: EndpointKind, path: PathBuf) -> Result<Self> {
        match Self::bind_socket(&path) {
            Ok(listener) => {
                info!(endpoint = kind.name(), path = %path.display(), "endpoint started");
                Ok(Self {
                    kind,
                    path,
                    listener,
                })
            }
            Err(err) => {
                error!(endpoint = kind.name(), %err, "listen error");
                Err(err)
            }
        }
    }

    fn bind_socket(path: &Path) -> Result<UnixListener> {
        if path.exists() {
            std::fs::remove_file(path).context("failed to remove stale socket")?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        let listener = UnixListener::bind(path).context("failed to bind Unix socket")?;

        // Unprivileged local clients connect here; the packet layer does
        // the authentication.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .context("failed to set socket permissions")?;

        Ok(listener)
    }
}

/// Runs one bound endpoint until shutdown.
pub async fn serve(
    endpoint: BoundEndpoint,
    shared: Arc<EndpointShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let BoundEndpoint {
        kind,
        path,
        listener,
    } = endpoint;

    let permits = Arc::new(Semaphore::new(kind.max_clients()));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        // Excess connections are refused immediately, not
                        // queued behind a permit.
                        match Arc::clone(&permits).try_acquire_owned() {
                            Ok(permit) => {
                                let shared = Arc::clone(&shared);
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    let _permit = permit;
                                    handle_connection(kind, stream, shared, shutdown).await;
                                });
                            }
                            Err(_) => {
                                warn!(endpoint = kind.name(), "client limit reached, refusing connection");
                                drop(stream);
                            }
                        }
                    }
                    Err(err) => {
                        error!(endpoint = kind.name(), %err, "accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender means the supervisor is gone; treat
                // it as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    info!(endpoint = kind.name(), "endpoint stopped");
}

/// One connection: read, reassemble, gate, dispatch, reply.
async fn handle_connection(
    kind: EndpointKind,
    stream: UnixStream,
    shared: Arc<EndpointShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (conn_id, session) = shared.sessions.register();
    info!(endpoint = kind.name(), conn_id, "client connected");

    let mut framed = Framed::new(stream, FrameCodec::new());

    loop {
        tokio::select! {
            next = framed.next() => {
                match next {
                    Some(Ok(frame)) => {
                        if let Some(reply) = process_frame(&shared, &session, &frame).await {
                            // Framed::send drives partial writes to
                            // completion; a failed write closes.
                            if let Err(err) = framed.send(reply).await {
                                warn!(endpoint = kind.name(), conn_id, %err, "client write error");
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(endpoint = kind.name(), conn_id, %err, "client error");
                        break;
                    }
                    None => {
                        debug!(endpoint = kind.name(), conn_id, "connection closed by peer");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(endpoint = kind.name(), conn_id, "closing connection for shutdown");
                    break;
                }
            }
        }
    }

    shared.sessions.unregister(conn_id);
    info!(endpoint = kind.name(), conn_id, "client disconnected");
}

/// Runs one frame through parse → session gate → dispatcher.
///
/// Returns the reply frame, or `None` for everything the security layers
/// reject: those are dropped in silence by design.
async fn process_frame(
    shared: &EndpointShared,
    session: &SessionHandle,
    frame: &[u8],
) -> Option<Vec<u8>> {
    let (header, payload) = match shared.codec.parse(frame) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(%err, "dropping unparseable frame");
            return None;
        }
    };

    // Token zero is the authentication round-trip.
    if header.token == 0 {
        let minted = {
            let mut session = session
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            session.authenticate(&payload, &shared.secret)
        };
        return match minted {
            Ok(token) => Some(shared.codec.build(token, 0, &token.to_le_bytes())),
            Err(err) => {
                debug!(%err, "dropping failed authentication");
                None
            }
        };
    }

    // Session gate: authenticated, right token, fresh sequence.
    {
        let mut session = session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(err) = session.accept_packet(header.token, header.sequence) {
            debug!(%err, "dropping rejected packet");
            return None;
        }
    }

    let reply = shared.dispatcher.dispatch_bytes(&payload).await;
    Some(shared.codec.build(header.token, header.sequence, &reply))
}
