use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    codec::Line,
    connection::{ConnectionHandle, WeakConnectionHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server-side set of open connections, keyed by session id.
///
/// Entries are weak: the registry can reach a connection while it is open
/// but never keeps one alive.
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<SessionId, WeakConnectionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn add(&self, connection: &ConnectionHandle) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().await.insert(id, connection.downgrade());
        debug!(session = %id, peer = %connection.peer(), "session registered");
        id
    }

    /// Returns whether `id` was present. Removing an absent id is a no-op.
    pub async fn remove(&self, id: SessionId) -> bool {
        let removed = self.sessions.lock().await.remove(&id).is_some();
        if removed {
            debug!(session = %id, "session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Sends `line` to every registered open connection except `excluding`
    /// and returns how many accepted it.
    pub async fn broadcast(&self, line: &Line, excluding: Option<SessionId>) -> usize {
        let sessions = self.sessions.lock().await;
        let mut delivered = 0;

        for (id, weak) in sessions.iter() {
            if Some(*id) == excluding {
                continue;
            }
            let Some(handle) = weak.upgrade() else {
                trace!(session = %id, "skipping dropped connection");
                continue;
            };
            match handle.send(line.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => trace!(session = %id, error = %err, "skipping connection"),
            }
        }

        delivered
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::{TcpListener, TcpStream},
        time::timeout,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::{Connection, ConnectionOptions};

    async fn connected(listener: &TcpListener) -> (Connection, BufReader<TcpStream>) {
        let port = listener.local_addr().expect("addr").port();
        let (peer, accepted) = tokio::join!(
            TcpStream::connect(("127.0.0.1", port)),
            listener.accept()
        );
        let (stream, addr) = accepted.expect("accept");
        let conn = Connection::accept(
            stream,
            addr,
            CancellationToken::new(),
            &ConnectionOptions::default(),
        )
        .expect("connection");
        (conn, BufReader::new(peer.expect("connect")))
    }

    fn line(text: &str) -> Line {
        Line::try_from(text).expect("valid line")
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("line in time")
            .expect("read");
        line
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = SessionRegistry::new();

        let (a, mut a_peer) = connected(&listener).await;
        let (b, mut b_peer) = connected(&listener).await;
        let (c, mut c_peer) = connected(&listener).await;
        let a_id = registry.add(a.handle()).await;
        registry.add(b.handle()).await;
        registry.add(c.handle()).await;

        let delivered = registry.broadcast(&line("hello"), Some(a_id)).await;
        assert_eq!(delivered, 2);
        assert_eq!(read_line(&mut b_peer).await, "hello\n");
        assert_eq!(read_line(&mut c_peer).await, "hello\n");

        // `a` only sees the next, unfiltered broadcast.
        registry.broadcast(&line("everyone"), None).await;
        assert_eq!(read_line(&mut a_peer).await, "everyone\n");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = SessionRegistry::new();
        let (conn, _peer) = connected(&listener).await;
        let id = registry.add(conn.handle()).await;

        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = SessionRegistry::new();
        let (a, _a_peer) = connected(&listener).await;
        let (b, _b_peer) = connected(&listener).await;

        let first = registry.add(a.handle()).await;
        let second = registry.add(b.handle()).await;
        assert!(first < second);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn broadcast_skips_closed_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = SessionRegistry::new();
        let (mut closed, _closed_peer) = connected(&listener).await;
        let (open, mut open_peer) = connected(&listener).await;
        registry.add(closed.handle()).await;
        registry.add(open.handle()).await;

        closed.close();
        while closed.next_event().await.is_some() {}

        assert_eq!(registry.broadcast(&line("still here"), None).await, 1);
        assert_eq!(read_line(&mut open_peer).await, "still here\n");
    }
}
