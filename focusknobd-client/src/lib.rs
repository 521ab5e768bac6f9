//! FocusKnob Client Library
//!
//! Talks to `focusknobd` over its Unix socket: correlated requests
//! (`status`, `reload_config`, `restart`, `logs`) and the daemon's pushes
//! (`status_update`, `input_request`) on the same connection. One task runs
//! [`IpcClient::listen`]; any number of tasks may call
//! [`IpcClient::request`] concurrently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use focusknob_common::ipc::{next_line, IpcBackend, UnixIpcBackend};
use focusknob_common::{CorrelatorError, Message, PendingRequests, ProtocolError, RequestKind};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use focusknob_common::paths::DEFAULT_SOCK;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the daemon")]
    NotConnected,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
}

type EventCallback = Arc<dyn Fn(Message) + Send + Sync>;

pub struct IpcClient {
    path: PathBuf,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Parked here by `connect` until `listen` takes it.
    reader: Mutex<Option<OwnedReadHalf>>,
    connected: AtomicBool,
    pending: PendingRequests<Message>,
    on_event: RwLock<Option<EventCallback>>,
}

impl IpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            pending: PendingRequests::new(),
            on_event: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the socket. A refused or missing socket is not an error here;
    /// callers retry, see [`IpcClient::connect_with_backoff`].
    pub async fn connect(&self) -> bool {
        let stream = match UnixIpcBackend::connect(&self.path).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Cannot connect to {}: {}", self.path.display(), e);
                return false;
            }
        };
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to daemon at {}", self.path.display());
        true
    }

    /// Keep trying to connect, doubling the pause from `initial` up to `max`.
    pub async fn connect_with_backoff(&self, initial: Duration, max: Duration) {
        let mut delay = initial;
        while !self.connect().await {
            debug!("Daemon unavailable, retrying in {}s", delay.as_secs());
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max);
        }
    }

    /// Called with every message that is not an answer to one of our
    /// requests.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self.on_event.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let line = message.to_line()?;
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let result = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.connected.store(false, Ordering::SeqCst);
            *writer = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send `kind` under a fresh id and wait up to `timeout` for its
    /// `_result`. `Ok(None)` means the daemon did not answer in time.
    pub async fn request(
        &self,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<Option<Message>, ClientError> {
        let id = Uuid::new_v4().to_string();
        let handle = self.pending.register(id.clone())?;
        if let Err(e) = self.send(&kind.into_message(id.clone())).await {
            self.pending.cancel(&id);
            return Err(e);
        }
        Ok(self.pending.await_result(handle, timeout).await)
    }

    /// Read until the daemon goes away, routing answers to their waiting
    /// requests and everything else to the event callback.
    pub async fn listen(&self) {
        let read_half = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(read_half) = read_half else {
            warn!("listen() called without a fresh connection");
            return;
        };
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            let line = match next_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!("Daemon read failed: {}", e);
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            match Message::from_line(&line) {
                Ok(message) => self.route(message),
                Err(e) => warn!("Dropping daemon line: {}", e),
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from daemon");
    }

    fn route(&self, message: Message) {
        if message.is_result() {
            if let Some(id) = message.id().map(str::to_string) {
                if self.pending.contains(&id) {
                    self.pending.fulfill(&id, message);
                    return;
                }
            }
        }
        let callback = self
            .on_event
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match callback {
            Some(callback) => callback(message),
            None => debug!("Unhandled {} message", message.kind()),
        }
    }

    /// Drop the connection. Waiting requests run into their timeouts.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focusknob_common::DaemonStatus;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    /// Answers `status` with a `_result` after pushing an unrelated event.
    async fn fake_daemon(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = tokio::io::BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(Message::Status { id }) = Message::from_line(&line) else {
                continue;
            };
            let push = Message::StatusUpdate {
                connected: false,
                port: None,
            };
            let stray = Message::StatusResult {
                id: "someone-else".into(),
                status: DaemonStatus::default(),
            };
            let reply = Message::StatusResult {
                id,
                status: DaemonStatus {
                    connected: true,
                    ..Default::default()
                },
            };
            for message in [push, stray, reply] {
                write_half
                    .write_all(message.to_line().unwrap().as_bytes())
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn request_gets_its_own_result_and_events_go_to_callback() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(fake_daemon(listener));

        let client = Arc::new(IpcClient::new(&sock));
        assert!(client.connect().await);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_event_callback(move |m| {
            let _ = tx.send(m);
        });
        tokio::spawn({
            let client = client.clone();
            async move { client.listen().await }
        });

        let reply = client
            .request(RequestKind::Status, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        match reply {
            Message::StatusResult { status, .. } => assert!(status.connected),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(Message::StatusUpdate { .. })));
        match rx.recv().await {
            Some(Message::StatusResult { id, .. }) => assert_eq!(id, "someone-else"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_daemon_times_out_and_leaves_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let _keep = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = IpcClient::new(&sock);
        assert!(client.connect().await);
        let reply = client
            .request(RequestKind::ReloadConfig, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn not_connected_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::new(dir.path().join("missing.sock"));
        assert!(!client.connect().await);
        assert!(matches!(
            client.request(RequestKind::Status, Duration::from_millis(10)).await,
            Err(ClientError::NotConnected)
        ));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn listen_ends_when_daemon_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("d.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = IpcClient::new(&sock);
        assert!(client.connect().await);
        server.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), client.listen())
            .await
            .unwrap();
        assert!(!client.is_connected());
    }
}
