//! Lifecycle of a single chat socket.
//!
//! A [`Connection`] owns one TCP stream through a background driver task. The
//! driver reads lines and reports them, in arrival order, as
//! [`ConnectionEvent`]s; writes are queued through [`ConnectionHandle::send`].
//! Every connection ends with exactly one terminal event, either
//! [`ConnectionEvent::Closed`] or [`ConnectionEvent::Failed`].

use std::{fmt, io, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, warn};

use crate::{
    codec::{FrameError, Line, LineCodec},
    error::ConnectionError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer finished its side of the stream.
    PeerClosed,
    /// The peer reset the connection while we were reading.
    PeerReset,
    /// `close()` was called or the shutdown token was cancelled.
    Local,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Line(Line),
    Closed(CloseReason),
    Failed(io::Error),
}

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Longest inbound line accepted before the connection is failed.
    pub max_line_length: Option<usize>,
    /// How long a local close may spend writing out queued lines. Whatever
    /// is still unsent after that is dropped.
    pub close_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_line_length: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    fn codec(&self) -> LineCodec {
        match self.max_line_length {
            Some(max) => LineCodec::with_max_length(max),
            None => LineCodec::new(),
        }
    }
}

pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    /// Opens an outbound connection to `host:port`.
    pub async fn connect(
        host: &str,
        port: u16,
        shutdown: CancellationToken,
        options: &ConnectionOptions,
    ) -> Result<Connection, ConnectionError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let addr = format!("{host}:{port}");
        debug!(%addr, "connecting");

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(source) => {
                state.send_replace(ConnectionState::Failed);
                return Err(ConnectionError::ConnectFailure { addr, source });
            }
        };
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(err) => {
                state.send_replace(ConnectionState::Failed);
                return Err(err.into());
            }
        };

        Ok(Self::open(stream, peer, state, shutdown, options))
    }

    /// Wraps a socket returned by `TcpListener::accept`.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
        options: &ConnectionOptions,
    ) -> Result<Connection, ConnectionError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        if let Err(err) = stream.set_nodelay(true) {
            state.send_replace(ConnectionState::Failed);
            return Err(err.into());
        }
        Ok(Self::open(stream, peer, state, shutdown, options))
    }

    /// Runs a connection over an in-memory transport.
    #[cfg(test)]
    pub(crate) fn from_transport<T>(
        transport: T,
        peer: SocketAddr,
        options: &ConnectionOptions,
    ) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self::open(transport, peer, state, CancellationToken::new(), options)
    }

    fn open<T>(
        transport: T,
        peer: SocketAddr,
        state: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
        options: &ConnectionOptions,
    ) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(transport, options.codec());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_rx = state.subscribe();
        state.send_replace(ConnectionState::Open);
        debug!(%peer, "connection open");

        let driver = Driver {
            peer,
            state,
            events: events_tx,
            close_timeout: options.close_timeout,
        };
        tokio::spawn(driver.run(framed, outbound_rx, shutdown.clone()));

        Connection {
            handle: ConnectionHandle {
                peer,
                state: state_rx,
                outbound: outbound_tx,
                shutdown,
            },
            events: events_rx,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.handle.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn send(&self, line: Line) -> Result<(), ConnectionError> {
        self.handle.send(line)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Next notification; `None` once the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }
}

/// Cloneable send/close capability for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<Line>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queues `line` for transmission. Only valid while the connection is
    /// open; success means the line was handed to the driver, not that the
    /// peer received it.
    pub fn send(&self, line: Line) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Open || self.shutdown.is_cancelled() {
            return Err(ConnectionError::InvalidState { state });
        }
        self.outbound
            .send(line)
            .map_err(|_| ConnectionError::InvalidState {
                state: self.state(),
            })
    }

    /// Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn downgrade(&self) -> WeakConnectionHandle {
        WeakConnectionHandle {
            peer: self.peer,
            state: self.state.clone(),
            outbound: self.outbound.downgrade(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Handle that does not keep the connection's outbound queue alive.
#[derive(Debug, Clone)]
pub struct WeakConnectionHandle {
    peer: SocketAddr,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::WeakUnboundedSender<Line>,
    shutdown: CancellationToken,
}

impl WeakConnectionHandle {
    pub fn upgrade(&self) -> Option<ConnectionHandle> {
        Some(ConnectionHandle {
            peer: self.peer,
            state: self.state.clone(),
            outbound: self.outbound.upgrade()?,
            shutdown: self.shutdown.clone(),
        })
    }
}

enum Outcome {
    Closed(CloseReason),
    Failed(io::Error),
}

struct Driver {
    peer: SocketAddr,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    close_timeout: Duration,
}

impl Driver {
    async fn run<T>(
        self,
        framed: Framed<T, LineCodec>,
        mut outbound: mpsc::UnboundedReceiver<Line>,
        shutdown: CancellationToken,
    ) where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut lines) = framed.split();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    break self.close_gracefully(&mut sink, &mut outbound).await;
                }
                inbound = lines.next() => match inbound {
                    Some(Ok(line)) => self.emit(ConnectionEvent::Line(line)),
                    Some(Err(FrameError::Io(err))) if is_reset(&err) => {
                        break Outcome::Closed(CloseReason::PeerReset);
                    }
                    Some(Err(err)) => break Outcome::Failed(err.into()),
                    None => break Outcome::Closed(CloseReason::PeerClosed),
                },
                queued = outbound.recv() => match queued {
                    Some(line) => {
                        // A peer that stops reading must not block close().
                        let written = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => None,
                            written = sink.send(line) => Some(written),
                        };
                        match written {
                            Some(Ok(())) => {}
                            Some(Err(err)) => break Outcome::Failed(err.into()),
                            None => break self.close_gracefully(&mut sink, &mut outbound).await,
                        }
                    }
                    None => break self.close_gracefully(&mut sink, &mut outbound).await,
                },
            }
        };

        self.finish(outcome);
    }

    /// Writes out lines already accepted by `send`, then shuts down the write
    /// half. Gives up after `close_timeout` and drops what is left.
    async fn close_gracefully<S>(
        &self,
        sink: &mut S,
        outbound: &mut mpsc::UnboundedReceiver<Line>,
    ) -> Outcome
    where
        S: futures::Sink<Line, Error = FrameError> + Unpin,
    {
        outbound.close();
        let flushed = tokio::time::timeout(self.close_timeout, async {
            while let Ok(line) = outbound.try_recv() {
                sink.feed(line).await?;
            }
            sink.close().await
        })
        .await;

        match flushed {
            Ok(Ok(())) => Outcome::Closed(CloseReason::Local),
            Ok(Err(FrameError::Io(err))) if is_reset(&err) => Outcome::Closed(CloseReason::Local),
            Ok(Err(err)) => Outcome::Failed(err.into()),
            Err(_) => {
                debug!(peer = %self.peer, "peer not reading, dropping unsent lines");
                Outcome::Closed(CloseReason::Local)
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner may already be gone; nothing left to notify then.
        let _ = self.events.send(event);
    }

    fn finish(&self, outcome: Outcome) {
        let next = match outcome {
            Outcome::Closed(_) => ConnectionState::Closed,
            Outcome::Failed(_) => ConnectionState::Failed,
        };
        let transitioned = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next;
            true
        });
        if !transitioned {
            return;
        }

        match outcome {
            Outcome::Closed(reason) => {
                debug!(peer = %self.peer, ?reason, "connection closed");
                self.emit(ConnectionEvent::Closed(reason));
            }
            Outcome::Failed(err) => {
                warn!(peer = %self.peer, error = %err, "connection failed");
                self.emit(ConnectionEvent::Failed(err));
            }
        }
    }
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
