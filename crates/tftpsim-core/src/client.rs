//! Transfer client.

use crate::DEFAULT_SERVER_PORT;
use crate::error::{Error, Result};
use crate::event::SharedSink;
use crate::message::Mode;
use crate::socket::{ReliableSocket, SocketConfig};
use crate::transfer::{
    BoxedSource, Destination, FileDestination, ReadTransfer, TransferSummary, WriteTransfer,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tftpsim_transport::AsyncUdpTransport;
use tokio::task::JoinHandle;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where requests are sent (a server, or a relay in front of one)
    pub server: SocketAddr,
    /// Retry policy
    pub socket: SocketConfig,
    /// Mode named in requests
    pub mode: Mode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_SERVER_PORT)),
            socket: SocketConfig::default(),
            mode: Mode::Octet,
        }
    }
}

/// Starts transfers against one server. Every transfer uses its own
/// socket, so a client can run any number of them at once.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    sink: SharedSink,
}

impl Client {
    /// Create a client reporting every transfer to `sink`
    pub fn new(config: ClientConfig, sink: SharedSink) -> Self {
        Self { config, sink }
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn socket(&self) -> Result<ReliableSocket> {
        let transport = AsyncUdpTransport::bind_ephemeral_for(self.config.server).await?;
        Ok(ReliableSocket::new(Arc::new(transport), self.config.socket, self.sink.clone())
            .with_remote(self.config.server))
    }

    /// Fetch `remote` into the local file `local`
    pub async fn read(&self, remote: &str, local: impl AsRef<Path>) -> Result<TransferSummary> {
        let output = FileDestination::create(local)
            .await
            .map_err(|source| Error::LocalIo {
                context: "creating output file",
                source,
            })?;
        self.read_into(remote, Box::new(output)).await
    }

    /// Fetch `remote` into any destination
    pub async fn read_into(
        &self,
        remote: &str,
        output: Box<dyn Destination>,
    ) -> Result<TransferSummary> {
        let socket = self.socket().await?;
        ReadTransfer::request(socket, remote, self.config.mode, output, self.sink.clone())
            .run()
            .await
    }

    /// Send the local file `local`, stored remotely as `remote`
    pub async fn write(&self, local: impl AsRef<Path>, remote: &str) -> Result<TransferSummary> {
        let input = tokio::fs::File::open(local)
            .await
            .map_err(|source| Error::LocalIo {
                context: "opening input file",
                source,
            })?;
        self.write_from(Box::new(input), remote).await
    }

    /// Send any byte source, stored remotely as `remote`
    pub async fn write_from(&self, input: BoxedSource, remote: &str) -> Result<TransferSummary> {
        let socket = self.socket().await?;
        WriteTransfer::request(socket, remote, self.config.mode, input, self.sink.clone())
            .run()
            .await
    }

    /// Run [`read`](Self::read) on its own task
    pub fn spawn_read(
        &self,
        remote: impl Into<String>,
        local: impl AsRef<Path>,
    ) -> JoinHandle<Result<TransferSummary>> {
        let client = self.clone();
        let remote = remote.into();
        let local = local.as_ref().to_path_buf();
        tokio::spawn(async move { client.read(&remote, local).await })
    }

    /// Run [`write`](Self::write) on its own task
    pub fn spawn_write(
        &self,
        local: impl AsRef<Path>,
        remote: impl Into<String>,
    ) -> JoinHandle<Result<TransferSummary>> {
        let client = self.clone();
        let remote = remote.into();
        let local = local.as_ref().to_path_buf();
        tokio::spawn(async move { client.write(local, &remote).await })
    }
}
