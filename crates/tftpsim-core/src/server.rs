//! Request-accepting server.
//!
//! One [`Worker`] receives requests on the well-known port. Each accepted
//! request gets a fresh ephemeral socket bound to the requester and its
//! own task running a transfer state machine, so a slow or stalled
//! transfer never holds up the listener or another transfer.

use crate::DEFAULT_SERVER_PORT;
use crate::error::{Error, Result};
use crate::event::SharedSink;
use crate::message::{ErrorCode, Message, Mode, RequestKind};
use crate::socket::{ReliableSocket, SocketConfig};
use crate::transfer::{FileDestination, ReadTransfer, TransferSummary, WriteTransfer};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tftpsim_transport::{
    AsyncUdpTransport, MAX_DATAGRAM_SIZE, Step, Transport, TransportConfig, TransportError, Worker,
};
use tokio::fs::File;
use tokio::sync::{Notify, RwLock, Semaphore};
use tracing::{debug, info, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening address
    pub bind_addr: SocketAddr,
    /// Directory files are served from and written to
    pub root: PathBuf,
    /// Retry policy for transfer sockets
    pub socket: SocketConfig,
    /// Cap on concurrently running transfers (`None` = unbounded)
    pub max_transfers: Option<usize>,
    /// Replace existing files on write requests instead of refusing
    pub allow_overwrite: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SERVER_PORT)),
            root: PathBuf::from("."),
            socket: SocketConfig::default(),
            max_transfers: None,
            allow_overwrite: false,
        }
    }
}

/// State reported when the server stops accepting requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Transfers still running; they continue to completion
    pub active_transfers: usize,
}

impl std::fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.active_transfers {
            0 => write!(f, "server stopped; no transfers in progress"),
            1 => write!(f, "server stopped; 1 transfer still in progress"),
            n => write!(f, "server stopped; {n} transfers still in progress"),
        }
    }
}

struct Shared {
    root: RwLock<PathBuf>,
    socket: SocketConfig,
    allow_overwrite: bool,
    active: AtomicUsize,
    idle: Notify,
    limiter: Option<Arc<Semaphore>>,
    sink: SharedSink,
}

/// A running server
pub struct Server {
    local_addr: SocketAddr,
    listener: Arc<AsyncUdpTransport>,
    shared: Arc<Shared>,
    worker: Worker,
}

impl Server {
    /// Bind the listening socket and start accepting requests.
    ///
    /// # Errors
    ///
    /// Fails if the listening socket cannot be bound; this is the only
    /// server error that is not scoped to a single transfer.
    pub async fn start(config: ServerConfig, sink: SharedSink) -> Result<Self> {
        let transport_config = TransportConfig {
            reuse_address: true,
            ..TransportConfig::default()
        };
        let listener =
            Arc::new(AsyncUdpTransport::bind_with_config(config.bind_addr, &transport_config).await?);
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            root: RwLock::new(config.root),
            socket: config.socket,
            allow_overwrite: config.allow_overwrite,
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            limiter: config.max_transfers.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            sink,
        });

        let worker = {
            let listener = listener.clone();
            let shared = shared.clone();
            Worker::spawn("server", move || {
                let listener = listener.clone();
                let shared = shared.clone();
                async move { shared.accept_one(&listener).await }
            })
        };

        info!(addr = %local_addr, "server listening");
        Ok(Self {
            local_addr,
            listener,
            shared,
            worker,
        })
    }

    /// Listening address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Directory currently being served
    pub async fn directory(&self) -> PathBuf {
        self.shared.root.read().await.clone()
    }

    /// Serve from `dir` for requests accepted from now on
    pub async fn set_directory(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let meta = tokio::fs::metadata(dir).await.map_err(|source| Error::LocalIo {
            context: "changing directory",
            source,
        })?;
        if !meta.is_dir() {
            return Err(Error::LocalIo {
                context: "changing directory",
                source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            });
        }

        *self.shared.root.write().await = dir.to_path_buf();
        info!(dir = %dir.display(), "serving directory changed");
        Ok(())
    }

    /// Transfers currently running
    pub fn active_transfers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Wait until no transfer is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.active_transfers() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting requests. Running transfers are left to finish.
    pub async fn shutdown(self) -> ShutdownReport {
        self.worker.stop();
        if let Err(e) = self.listener.close().await {
            debug!("listener close failed: {e}");
        }
        if let Err(e) = self.worker.join().await {
            warn!("{e}");
        }

        let report = ShutdownReport {
            active_transfers: self.shared.active.load(Ordering::SeqCst),
        };
        info!(active = report.active_transfers, "{report}");
        report
    }
}

impl Shared {
    /// Unit of work for the accept loop: take one request and dispatch it
    async fn accept_one(self: &Arc<Self>, listener: &AsyncUdpTransport) -> Result<Step> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = match listener.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(TransportError::Closed) => return Ok(Step::Stop),
            Err(e) => return Err(e.into()),
        };

        match Message::decode(&buf[..len]) {
            Ok(Message::Request {
                kind,
                filename,
                mode,
            }) => {
                debug!(peer = %from, file = %filename, ?kind, "request received");
                self.dispatch(kind, filename, mode, from).await?;
            }
            Ok(other) => {
                debug!(peer = %from, "unexpected {other} on listening port");
                let reply = Message::error(ErrorCode::IllegalOperation, "expected a read or write request");
                listener.send_to(&reply.encode(), from).await?;
            }
            Err(e) => {
                debug!(peer = %from, "undecodable request: {e}");
                let reply = Message::error(ErrorCode::IllegalOperation, e.to_string());
                listener.send_to(&reply.encode(), from).await?;
            }
        }

        Ok(Step::Continue)
    }

    async fn dispatch(
        self: &Arc<Self>,
        kind: RequestKind,
        filename: String,
        mode: Mode,
        client: SocketAddr,
    ) -> Result<()> {
        let transport = Arc::new(AsyncUdpTransport::bind_ephemeral_for(client).await?);
        let socket = ReliableSocket::new(transport, self.socket, self.sink.clone()).bound_to(client);

        let path = match self.resolve(&filename).await {
            Ok(path) => path,
            Err(text) => {
                socket
                    .send(&Message::error(ErrorCode::AccessViolation, text), None)
                    .await?;
                return Ok(());
            }
        };

        match kind {
            RequestKind::Read => {
                let file = match File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => return refuse(&socket, &e).await,
                };
                debug!(?mode, path = %path.display(), "serving read");
                let transfer = WriteTransfer::serve(socket, filename, Box::new(file), self.sink.clone());
                self.spawn_transfer(transfer.run());
            }
            RequestKind::Write => {
                let created = if self.allow_overwrite {
                    FileDestination::create(&path).await
                } else {
                    FileDestination::create_new(&path).await
                };
                let dest = match created {
                    Ok(dest) => dest,
                    Err(e) => return refuse(&socket, &e).await,
                };
                debug!(?mode, path = %path.display(), "accepting write");
                let transfer = ReadTransfer::granted(socket, filename, Box::new(dest), self.sink.clone());
                self.spawn_transfer(transfer.run());
            }
        }

        Ok(())
    }

    /// Map a requested name onto the served directory, refusing anything
    /// that would escape it
    async fn resolve(&self, filename: &str) -> std::result::Result<PathBuf, &'static str> {
        let requested = Path::new(filename);
        if filename.is_empty() {
            return Err("empty file name");
        }
        if !requested
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err("file name must be relative to the served directory");
        }
        Ok(self.root.read().await.join(requested))
    }

    fn spawn_transfer<F>(self: &Arc<Self>, transfer: F)
    where
        F: Future<Output = Result<TransferSummary>> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();

        tokio::spawn(async move {
            let _permit = match &shared.limiter {
                Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                None => None,
            };

            match transfer.await {
                Ok(summary) => debug!(file = %summary.filename, bytes = summary.bytes, "transfer task done"),
                Err(e) => debug!("transfer task failed: {e}"),
            }

            if shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                shared.idle.notify_waiters();
            }
        });
    }
}

/// Answer a request that cannot be served with the matching error
async fn refuse(socket: &ReliableSocket, err: &std::io::Error) -> Result<()> {
    let code = ErrorCode::from_io(err);
    let text = match code {
        ErrorCode::NotDefined => err.to_string(),
        _ => code.default_message().to_string(),
    };
    socket.send(&Message::error(code, text), None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(root: &Path) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.to_path_buf(),
            socket: SocketConfig {
                timeout: Duration::from_millis(100),
                attempts: 3,
            },
            ..ServerConfig::default()
        }
    }

    async fn exchange(server: SocketAddr, request: &Message) -> (Message, SocketAddr) {
        let client = AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap();
        client.send_to(&request.encode(), server).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (Message::decode(&buf[..len]).unwrap(), from)
    }

    #[tokio::test]
    async fn test_missing_file_not_found() {
        let dir = tempdir().unwrap();
        let server = Server::start(config(dir.path()), Arc::new(NullSink)).await.unwrap();

        let (reply, from) = exchange(server.local_addr(), &Message::read("nope.txt", Mode::Octet)).await;
        assert!(matches!(
            reply,
            Message::Error {
                code: ErrorCode::FileNotFound,
                ..
            }
        ));
        // replies come from a fresh TID, not the listening port
        assert_ne!(from, server.local_addr());
        assert_eq!(server.shutdown().await.active_transfers, 0);
    }

    #[tokio::test]
    async fn test_path_traversal_refused() {
        let dir = tempdir().unwrap();
        let server = Server::start(config(dir.path()), Arc::new(NullSink)).await.unwrap();

        for name in ["../etc/passwd", "/etc/passwd", ""] {
            let (reply, _) = exchange(server.local_addr(), &Message::read(name, Mode::Octet)).await;
            assert!(matches!(
                reply,
                Message::Error {
                    code: ErrorCode::AccessViolation,
                    ..
                }
            ));
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_existing_file_refused_on_write() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("taken.txt"), b"old").unwrap();
        let server = Server::start(config(dir.path()), Arc::new(NullSink)).await.unwrap();

        let (reply, _) = exchange(server.local_addr(), &Message::write("taken.txt", Mode::Octet)).await;
        assert!(matches!(
            reply,
            Message::Error {
                code: ErrorCode::FileAlreadyExists,
                ..
            }
        ));
        assert_eq!(std::fs::read(dir.path().join("taken.txt")).unwrap(), b"old");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_request_on_listener() {
        let dir = tempdir().unwrap();
        let server = Server::start(config(dir.path()), Arc::new(NullSink)).await.unwrap();

        let (reply, from) = exchange(server.local_addr(), &Message::ack(1)).await;
        assert_eq!(from, server.local_addr());
        assert!(matches!(
            reply,
            Message::Error {
                code: ErrorCode::IllegalOperation,
                ..
            }
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_grant_and_active_count() {
        let dir = tempdir().unwrap();
        let server = Server::start(config(dir.path()), Arc::new(NullSink)).await.unwrap();

        let (reply, _) = exchange(server.local_addr(), &Message::write("new.txt", Mode::Octet)).await;
        assert_eq!(reply, Message::ack(0));
        assert_eq!(server.active_transfers(), 1);

        // the abandoned client makes the transfer give up
        tokio::time::timeout(Duration::from_secs(3), server.wait_idle())
            .await
            .unwrap();
        assert_eq!(server.active_transfers(), 0);
        assert!(!dir.path().join("new.txt").exists());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_directory() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        std::fs::write(second.path().join("moved.txt"), b"here").unwrap();
        let server = Server::start(config(first.path()), Arc::new(NullSink)).await.unwrap();

        assert!(server.set_directory(second.path().join("missing")).await.is_err());
        server.set_directory(second.path()).await.unwrap();
        assert_eq!(server.directory().await, second.path());

        let (reply, _) = exchange(server.local_addr(), &Message::read("moved.txt", Mode::Octet)).await;
        assert_eq!(reply, Message::data(1, b"here".to_vec()));
        server.shutdown().await;
    }

    #[test]
    fn test_shutdown_report_display() {
        assert_eq!(
            ShutdownReport { active_transfers: 2 }.to_string(),
            "server stopped; 2 transfers still in progress"
        );
        assert_eq!(
            ShutdownReport { active_transfers: 0 }.to_string(),
            "server stopped; no transfers in progress"
        );
    }
}
