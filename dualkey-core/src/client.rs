use crate::errors::{Error, Result};
use crate::types::{Action, KeyLocation};
use crate::wire::{self, STATUS_OK};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single attempt against one endpoint: the response body or the reason it failed.
pub type FetchOutcome = Result<Vec<u8>>;

/// One request/response exchange with one key-custody endpoint.
#[async_trait]
pub trait KeyFetch: Send + Sync {
    async fn fetch(
        &self,
        address: &str,
        location: KeyLocation,
        action: Action,
        payload: &[u8],
    ) -> FetchOutcome;
}

#[async_trait]
impl<T> KeyFetch for Arc<T>
where
    T: KeyFetch + ?Sized,
{
    async fn fetch(
        &self,
        address: &str,
        location: KeyLocation,
        action: Action,
        payload: &[u8],
    ) -> FetchOutcome {
        (**self).fetch(address, location, action, payload).await
    }
}

/// Builder for [`KeyStoreClient`].
#[derive(Clone, Debug, Default)]
pub struct KeyStoreClientBuilder {
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
}

impl KeyStoreClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = Some(duration);
        self
    }

    /// Deadline for writing the request and reading the full response.
    pub fn io_timeout(mut self, duration: Duration) -> Self {
        self.io_timeout = Some(duration);
        self
    }

    pub fn build(self) -> KeyStoreClient {
        KeyStoreClient {
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            io_timeout: self.io_timeout.unwrap_or(DEFAULT_IO_TIMEOUT),
        }
    }
}

/// TCP client for a key-custody endpoint. Opens a fresh connection per call and never retries.
#[derive(Clone, Debug)]
pub struct KeyStoreClient {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Default for KeyStoreClient {
    fn default() -> Self {
        KeyStoreClientBuilder::new().build()
    }
}

impl KeyStoreClient {
    pub fn builder() -> KeyStoreClientBuilder {
        KeyStoreClientBuilder::new()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Like [`KeyFetch::fetch`] but resolves the action by name first. Unknown names fail with
    /// [`Error::UnsupportedAction`] before any connection is opened.
    pub async fn fetch_named(
        &self,
        address: &str,
        location: KeyLocation,
        action: &str,
        payload: &[u8],
    ) -> FetchOutcome {
        let action: Action = action.parse()?;
        self.fetch(address, location, action, payload).await
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(Error::transport(address, format!("connect failed: {err}"))),
            Err(_) => Err(Error::transport(
                address,
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        address: &str,
        action: Action,
        request: &wire::WireRequest,
    ) -> FetchOutcome {
        match timeout(self.io_timeout, write_and_read(stream, address, action, request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::transport(
                address,
                format!("no {action} response within {:?}", self.io_timeout),
            )),
        }
    }
}

async fn write_and_read(
    stream: &mut TcpStream,
    address: &str,
    action: Action,
    request: &wire::WireRequest,
) -> FetchOutcome {
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| Error::transport(address, format!("write failed: {err}")))?;

    let size = action.response_size();
    let mut buffer = vec![0u8; size];
    stream
        .read_exact(&mut buffer[..1])
        .await
        .map_err(|err| Error::transport(address, format!("read failed: {err}")))?;
    // Failure responses may carry no body at all.
    if buffer[0] == STATUS_OK {
        stream.read_exact(&mut buffer[1..]).await.map_err(|err| {
            Error::transport(address, format!("truncated {action} response: {err}"))
        })?;
    }
    wire::decode(&buffer, size, address).map(|response| response.body)
}

#[async_trait]
impl KeyFetch for KeyStoreClient {
    async fn fetch(
        &self,
        address: &str,
        location: KeyLocation,
        action: Action,
        payload: &[u8],
    ) -> FetchOutcome {
        let request = wire::encode(location, action, payload);
        debug!(endpoint = address, %location, %action, "sending key-custody request");

        let mut stream = self.connect(address).await?;
        let outcome = self.exchange(&mut stream, address, action, &request).await;
        if let Err(err) = stream.shutdown().await {
            trace!(endpoint = address, error = %err, "shutdown after exchange failed");
        }
        drop(stream);
        outcome
    }
}
