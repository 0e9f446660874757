//! Server, relay and client on loopback, for end-to-end transfers
//!
//! # Example
//!
//! ```no_run
//! use tftpsim_integration_tests::fixtures::{TransferFixture, pattern};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let fixture = TransferFixture::with_relay("drop:3".parse()?).await?;
//! fixture.put("blob.bin", &pattern(1500))?;
//!
//! let target = fixture.download_path("blob.bin");
//! fixture.client().read("blob.bin", &target).await?;
//!
//! fixture.cleanup().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tftpsim_core::{
    Client, ClientConfig, Mode, NullSink, Server, ServerConfig, SharedSink, SocketConfig,
    TransferEvent, sink_fn,
};
use tftpsim_faults::{FaultError, FaultSpec, Relay, RelayConfig};
use thiserror::Error;

/// Fixture setup failures
#[derive(Debug, Error)]
pub enum FixtureError {
    /// Server or client failure
    #[error("core: {0}")]
    Core(#[from] tftpsim_core::Error),
    /// Relay failure
    #[error("relay: {0}")]
    Fault(#[from] FaultError),
    /// Temporary directory failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Retry policy short enough to keep lossy tests quick
pub fn fast_socket() -> SocketConfig {
    SocketConfig {
        timeout: Duration::from_millis(300),
        attempts: 5,
    }
}

/// Deterministic, non-repeating-per-block test content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A server over a temporary directory, optionally fronted by a relay
pub struct TransferFixture {
    /// Directory the server serves
    pub root: TempDir,
    /// Directory for client-side files
    pub local: TempDir,
    server: Server,
    relay: Option<Relay>,
    events: Arc<Mutex<Vec<TransferEvent>>>,
}

impl TransferFixture {
    /// Server only; clients talk to it directly
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind.
    pub async fn new() -> Result<Self, FixtureError> {
        Self::build(None).await
    }

    /// Server behind a relay applying `fault` to each session
    ///
    /// # Errors
    ///
    /// Returns an error if the server or the relay cannot bind.
    pub async fn with_relay(fault: FaultSpec) -> Result<Self, FixtureError> {
        Self::build(Some(Some(fault))).await
    }

    /// Server behind a relay with no fault armed
    ///
    /// # Errors
    ///
    /// Returns an error if the server or the relay cannot bind.
    pub async fn with_clean_relay() -> Result<Self, FixtureError> {
        Self::build(Some(None)).await
    }

    async fn build(relay: Option<Option<FaultSpec>>) -> Result<Self, FixtureError> {
        let root = tempfile::tempdir()?;
        let local = tempfile::tempdir()?;

        let server = Server::start(
            ServerConfig {
                bind_addr: loopback(),
                root: root.path().to_path_buf(),
                socket: fast_socket(),
                ..ServerConfig::default()
            },
            Arc::new(NullSink),
        )
        .await?;

        let relay = match relay {
            Some(fault) => Some(
                Relay::bind(RelayConfig {
                    bind_addr: loopback(),
                    server_addr: server.local_addr(),
                    idle_timeout: Duration::from_millis(1500),
                    linger: Duration::from_millis(200),
                    fault,
                })
                .await?,
            ),
            None => None,
        };

        Ok(Self {
            root,
            local,
            server,
            relay,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The address clients should send requests to
    pub fn target(&self) -> SocketAddr {
        self.relay
            .as_ref()
            .map_or_else(|| self.server.local_addr(), Relay::local_addr)
    }

    /// The running relay, if any
    pub fn relay(&self) -> Option<&Relay> {
        self.relay.as_ref()
    }

    /// Client aimed at [`target`](Self::target) whose events are recorded
    pub fn client(&self) -> Client {
        let events = self.events.clone();
        let sink: SharedSink = sink_fn(move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        Client::new(
            ClientConfig {
                server: self.target(),
                socket: fast_socket(),
                mode: Mode::Octet,
            },
            sink,
        )
    }

    /// Place a file in the served directory
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn put(&self, name: &str, contents: &[u8]) -> Result<PathBuf, FixtureError> {
        let path = self.root.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Place a file in the client-side directory
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn put_local(&self, name: &str, contents: &[u8]) -> Result<PathBuf, FixtureError> {
        let path = self.local.path().join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Path in the client-side directory
    pub fn download_path(&self, name: &str) -> PathBuf {
        self.local.path().join(name)
    }

    /// Path in the served directory
    pub fn served_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Client events recorded so far
    pub fn events(&self) -> Vec<TransferEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded client events matching `predicate`
    pub fn count(&self, predicate: impl Fn(&TransferEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    /// Wait until the server has no transfers in flight
    pub async fn server_idle(&self) {
        // bounded so a stuck transfer fails the test instead of hanging it
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server.wait_idle()).await;
    }

    /// Stop the relay and the server
    pub async fn cleanup(self) {
        if let Some(relay) = self.relay {
            let active = relay.shutdown().await;
            tracing::debug!(active, "relay stopped");
        }
        let report = self.server.shutdown().await;
        tracing::debug!(%report, "server stopped");
    }
}
