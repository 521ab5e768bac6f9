//! Local socket plumbing shared by the daemon and its clients.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};

#[async_trait]
pub trait IpcBackend: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: IpcListener<Stream = Self::Stream> + Send + 'static;

    async fn bind(addr: &Path) -> io::Result<Self::Listener>;
    async fn connect(addr: &Path) -> io::Result<Self::Stream>;
}

#[async_trait]
pub trait IpcListener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

pub struct UnixIpcBackend;

pub struct UnixIpcListener {
    inner: UnixListener,
    path: PathBuf,
}

impl UnixIpcListener {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IpcBackend for UnixIpcBackend {
    type Stream = UnixStream;
    type Listener = UnixIpcListener;

    async fn bind(addr: &Path) -> io::Result<Self::Listener> {
        match addr.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        clear_stale_socket(addr)?;
        let listener = UnixListener::bind(addr)?;
        std::fs::set_permissions(addr, std::fs::Permissions::from_mode(0o600))?;
        Ok(UnixIpcListener {
            inner: listener,
            path: addr.to_path_buf(),
        })
    }

    async fn connect(addr: &Path) -> io::Result<Self::Stream> {
        UnixStream::connect(addr).await
    }
}

/// `bind(2)` refuses a path that already exists, and a socket file outlives
/// the process that created it. Only socket files are removed so that a
/// mistyped path never deletes user data.
fn clear_stale_socket(addr: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(addr) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(addr),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", addr.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl IpcListener for UnixIpcListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

/// Read the next complete `\n`-terminated line, decoded lossily and
/// trimmed. `Ok(None)` means the peer closed the stream; a trailing
/// fragment without newline at that point is discarded.
pub async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).trim().to_string()))
}
