//! Unix socket server for the desktop UI.
//!
//! Each accepted connection gets a reader task that parses inbound lines
//! and a writer task fed by an unbounded queue; replies and pushes for one
//! client are therefore written whole and in order.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use focusknob_common::ipc::{next_line, IpcBackend, IpcListener, UnixIpcBackend};
use focusknob_common::Message;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Answers one inbound message; `Some` is written back to the sender only.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Option<Message>;
}

/// Broadcast side of the server, as seen by the sync loop and workflows.
pub trait EventSink: Send + Sync {
    fn push_event(&self, message: &Message);
    fn has_clients(&self) -> bool;
}

struct ClientConn {
    tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    clients: Mutex<HashMap<u64, ClientConn>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn clients(&self) -> MutexGuard<'_, HashMap<u64, ClientConn>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drop_client(&self, id: u64) {
        if self.clients().remove(&id).is_some() {
            debug!(client = id, "IPC client disconnected");
        }
    }

    fn send_to(&self, id: u64, line: String) -> bool {
        match self.clients().get(&id) {
            Some(conn) => conn.tx.send(line).is_ok(),
            None => false,
        }
    }
}

pub struct IpcServer {
    path: PathBuf,
    shared: Arc<Shared>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shared: Arc::new(Shared::default()),
            accept: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the socket (owner-only) and start accepting in the background.
    pub async fn start<H: MessageHandler>(&self, handler: Arc<H>) -> io::Result<()> {
        let listener = UnixIpcBackend::bind(&self.path).await?;
        self.shared.running.store(true, Ordering::SeqCst);
        info!("IPC server listening on {}", self.path.display());

        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(listener, shared, handler));
        *self.accept.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Close every connection, stop accepting and remove the socket file.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        for (_, conn) in self.shared.clients().drain() {
            conn.reader.abort();
            conn.writer.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
        info!("IPC server stopped");
    }
}

impl EventSink for IpcServer {
    fn push_event(&self, message: &Message) {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping unencodable {} event: {}", message.kind(), e);
                return;
            }
        };
        for (id, conn) in self.shared.clients().iter() {
            if conn.tx.send(line.clone()).is_err() {
                debug!(client = id, "Event not queued, client is closing");
            }
        }
    }

    fn has_clients(&self) -> bool {
        !self.shared.clients().is_empty()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<L, H>(mut listener: L, shared: Arc<Shared>, handler: Arc<H>)
where
    L: IpcListener,
    H: MessageHandler,
{
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                warn!("IPC accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        register_client(stream, &shared, handler.clone());
    }
}

fn register_client<S, H>(stream: S, shared: &Arc<Shared>, handler: Arc<H>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: MessageHandler,
{
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    // Hold the map lock while spawning so the tasks cannot look the
    // client up before it is inserted.
    let mut clients = shared.clients();
    let writer = tokio::spawn(write_loop(id, write_half, rx, shared.clone()));
    let reader = tokio::spawn(read_loop(id, read_half, shared.clone(), handler));
    clients.insert(id, ClientConn { tx, reader, writer });
    debug!(client = id, total = clients.len(), "IPC client connected");
}

async fn write_loop<W>(
    id: u64,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(client = id, "IPC write failed: {}", e);
            break;
        }
    }
    shared.drop_client(id);
}

async fn read_loop<R, H>(id: u64, reader: R, shared: Arc<Shared>, handler: Arc<H>)
where
    R: AsyncRead + Unpin,
    H: MessageHandler,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let line = match next_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(client = id, "IPC read failed: {}", e);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        let message = match Message::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(client = id, "Dropping IPC line: {}", e);
                continue;
            }
        };
        let Some(reply) = handler.handle(message).await else {
            continue;
        };
        match reply.to_line() {
            Ok(out) => {
                if !shared.send_to(id, out) {
                    break;
                }
            }
            Err(e) => warn!(client = id, "Failed to encode {} reply: {}", reply.kind(), e),
        }
    }
    shared.drop_client(id);
}
