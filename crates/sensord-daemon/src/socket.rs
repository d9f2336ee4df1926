//! Transport gateway: the unix stream socket clients receive samples on.
//!
//! One listener at a fixed filesystem path; each accepted connection
//! identifies itself by writing its granted session id (little-endian i64)
//! as the first bytes on the wire, and from then on the connection is the
//! session's sample stream. Peer credentials are captured at accept time so
//! the status dump can report client PIDs. When a client disconnects, a
//! lost-session event is pushed into the daemon's event queue.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sensord_core::SessionId;
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::ManagerEvent;

struct SessionSocket {
    stream: OwnedWriteHalf,
    /// Peer PID rendered at accept time, or the credential error message.
    peer: String,
}

/// Cloneable handle onto the session socket table.
#[derive(Clone, Default)]
pub struct SocketHandler {
    sessions: Arc<Mutex<HashMap<SessionId, SessionSocket>>>,
}

impl SocketHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the listener, opens its permissions to all local users, and
    /// spawns the accept loop.
    pub fn listen(&self, path: &Path, events: mpsc::Sender<ManagerEvent>) -> io::Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
            warn!(path = %path.display(), %err, "failed to set socket permissions");
        }
        info!(path = %path.display(), "sample socket listening");

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let sessions = sessions.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, sessions, events).await;
                        });
                    }
                    Err(err) => {
                        warn!(%err, "sample socket accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Forwards `payload` to the session's socket without blocking. Failure
    /// means the sample is lost; the caller only logs it.
    pub fn write(&self, session: SessionId, payload: &[u8]) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(socket) = sessions.get_mut(&session) else {
            warn!(session, "write to unknown session");
            return false;
        };

        let mut written = 0;
        while written < payload.len() {
            match socket.stream.try_write(&payload[written..]) {
                Ok(0) => return false,
                Ok(n) => written += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    warn!(session, "session socket not writable, dropping sample tail");
                    return false;
                }
                Err(err) => {
                    debug!(session, %err, "session socket write failed");
                    return false;
                }
            }
        }
        true
    }

    /// Drops the session's socket slot, closing the stream towards the
    /// client. Unknown sessions are ignored.
    pub fn remove_session(&self, session: SessionId) {
        if self.sessions.lock().remove(&session).is_some() {
            debug!(session, "session socket removed");
        }
    }

    /// The peer PID (or credential error text) for a connected session;
    /// `None` when the session has no socket.
    pub fn peer_label(&self, session: SessionId) -> Option<String> {
        self.sessions
            .lock()
            .get(&session)
            .map(|socket| socket.peer.clone())
    }

    pub fn has_session(&self, session: SessionId) -> bool {
        self.sessions.lock().contains_key(&session)
    }
}

async fn handle_connection(
    stream: UnixStream,
    sessions: Arc<Mutex<HashMap<SessionId, SessionSocket>>>,
    events: mpsc::Sender<ManagerEvent>,
) {
    let peer = match stream.peer_cred() {
        Ok(cred) => cred
            .pid()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "n/a".to_string()),
        Err(err) => err.to_string(),
    };

    let (mut read_half, write_half) = stream.into_split();

    let mut id_buf = [0u8; 8];
    if let Err(err) = read_half.read_exact(&mut id_buf).await {
        debug!(%err, "connection closed before session handshake");
        return;
    }
    let session = SessionId::from_le_bytes(id_buf);
    if session <= 0 {
        warn!(session, "rejecting connection with invalid session id");
        return;
    }
    debug!(session, peer = %peer, "session socket connected");

    let replaced = sessions
        .lock()
        .insert(
            session,
            SessionSocket {
                stream: write_half,
                peer,
            },
        )
        .is_some();
    if replaced {
        warn!(session, "session socket replaced by a new connection");
    }

    // Clients never send past the handshake; the read half only watches for
    // disconnect.
    let mut scratch = [0u8; 64];
    loop {
        match read_half.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    if sessions.lock().remove(&session).is_some() {
        debug!(session, "session socket disconnected");
        let _ = events.send(ManagerEvent::LostSession(session)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn socket_path(name: &str) -> std::path::PathBuf {
        let dir = tempfile::tempdir().unwrap();
        // Keep the directory alive by leaking it; the path must outlive the
        // listener and temp dirs are cleaned by the OS.
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    async fn connect(path: &Path, session: SessionId) -> UnixStream {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(&session.to_le_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        stream
    }

    #[tokio::test]
    async fn handshake_registers_the_session() {
        let path = socket_path("sensord-test.sock");
        let (events_tx, _events_rx) = mpsc::channel(8);
        let handler = SocketHandler::new();
        handler.listen(&path, events_tx).unwrap();

        let _client = connect(&path, 11).await;
        tokio::task::yield_now().await;
        // Accept runs on the same runtime; give it a moment.
        for _ in 0..50 {
            if handler.has_session(11) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(handler.has_session(11));
        assert!(handler.peer_label(11).is_some());
    }

    #[tokio::test]
    async fn samples_reach_the_client_in_order() {
        let path = socket_path("sensord-test.sock");
        let (events_tx, _events_rx) = mpsc::channel(8);
        let handler = SocketHandler::new();
        handler.listen(&path, events_tx).unwrap();

        let mut client = connect(&path, 5).await;
        for _ in 0..50 {
            if handler.has_session(5) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(handler.write(5, b"abc"));
        assert!(handler.write(5, b"def"));

        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[tokio::test]
    async fn disconnect_emits_lost_session() {
        let path = socket_path("sensord-test.sock");
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handler = SocketHandler::new();
        handler.listen(&path, events_tx).unwrap();

        let client = connect(&path, 9).await;
        for _ in 0..50 {
            if handler.has_session(9) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        drop(client);

        match events_rx.recv().await {
            Some(ManagerEvent::LostSession(9)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!handler.has_session(9));
    }

    #[tokio::test]
    async fn server_side_removal_does_not_emit_lost_session() {
        let path = socket_path("sensord-test.sock");
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handler = SocketHandler::new();
        handler.listen(&path, events_tx).unwrap();

        let client = connect(&path, 4).await;
        for _ in 0..50 {
            if handler.has_session(4) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        handler.remove_session(4);
        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(events_rx.try_recv().is_err());
        assert!(!handler.write(4, b"gone"));
    }
}
