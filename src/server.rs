use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    codec::Line,
    config::ServerConfig,
    connection::{Connection, ConnectionEvent, ConnectionOptions},
    registry::{SessionId, SessionRegistry},
};

// Pause after a failed accept, e.g. on EMFILE, before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct Policy {
    echo: bool,
    announce: bool,
    connection: ConnectionOptions,
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    policy: Arc<Policy>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(SessionRegistry::new()),
            policy: Arc::new(Policy {
                echo: config.echo,
                announce: config.announce,
                connection: ConnectionOptions {
                    max_line_length: config.max_line_length,
                    ..ConnectionOptions::default()
                },
            }),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts clients until `shutdown` resolves, then closes every session
    /// and waits for them to finish.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            policy,
        } = self;
        let sessions = TaskTracker::new();
        let cancel = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_session(stream, peer, &registry, &policy, &cancel, &sessions);
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        cancel.cancel();
        sessions.close();
        sessions.wait().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> io::Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<SessionRegistry>,
    policy: &Arc<Policy>,
    cancel: &CancellationToken,
    sessions: &TaskTracker,
) {
    debug!(%peer, "accepted connection");
    let token = cancel.child_token();
    let connection = match Connection::accept(stream, peer, token, &policy.connection) {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%peer, error = %err, "failed to set up connection");
            return;
        }
    };

    let registry = Arc::clone(registry);
    let policy = Arc::clone(policy);
    sessions.spawn(async move {
        process(connection, registry, policy).await;
    });
}

async fn process(
    mut connection: Connection,
    registry: Arc<SessionRegistry>,
    policy: Arc<Policy>,
) {
    let peer = connection.peer();
    let id = registry.add(connection.handle()).await;
    info!(session = %id, %peer, "client connected");

    if policy.announce {
        announce(&registry, id, format!("* {peer} joined")).await;
    }

    let excluding = if policy.echo { None } else { Some(id) };
    while let Some(event) = connection.next_event().await {
        match event {
            ConnectionEvent::Line(line) => {
                let delivered = registry.broadcast(&line, excluding).await;
                debug!(session = %id, bytes = line.len(), delivered, "relayed line");
            }
            ConnectionEvent::Closed(reason) => {
                info!(session = %id, %peer, ?reason, "client disconnected");
                break;
            }
            ConnectionEvent::Failed(err) => {
                warn!(session = %id, %peer, error = %err, "client connection failed");
                break;
            }
        }
    }

    registry.remove(id).await;

    if policy.announce {
        announce(&registry, id, format!("* {peer} left")).await;
    }
}

async fn announce(registry: &SessionRegistry, id: SessionId, text: String) {
    match Line::try_from(text) {
        Ok(notice) => {
            registry.broadcast(&notice, Some(id)).await;
        }
        Err(err) => warn!(session = %id, error = %err, "presence notice not sent"),
    }
}
