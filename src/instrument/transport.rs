//! Line-oriented SCPI transports.
//!
//! A transport moves newline-terminated command strings to the instrument and
//! reads single-line responses back. It knows nothing about what the commands
//! mean; that lives in [`scpi`](super::scpi).

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AppResult, DaqError};

/// Send/receive boundary used by [`ScpiDriver`](super::scpi::ScpiDriver).
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without reading a response.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Raw SCPI over TCP (`TCPIP::host::port::SOCKET`).
///
/// A write or query that times out or fails drops the socket. The next call
/// opens a fresh one, so a reply that arrives after its query gave up can
/// never be read as the answer to a later query.
pub struct TcpTransport {
    instrument: String,
    endpoint: String,
    timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

const LINE_TERMINATOR: &str = "\n";

impl TcpTransport {
    /// Opens the socket, bounded by `timeout`.
    pub async fn connect(
        instrument: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> AppResult<Self> {
        let transport = Self {
            instrument: instrument.to_string(),
            endpoint: format!("{}:{}", host, port),
            timeout,
            stream: Mutex::new(None),
        };
        let stream = transport.open().await?;
        *transport.stream.lock().await = Some(stream);
        Ok(transport)
    }

    async fn open(&self) -> AppResult<BufReader<TcpStream>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| self.comm_error(format!("connect to {} timed out", self.endpoint)))?
            .map_err(|e| self.comm_error(format!("connect to {}: {}", self.endpoint, e)))?;
        debug!(instrument = %self.instrument, endpoint = %self.endpoint, "SCPI socket connected");
        Ok(BufReader::new(stream))
    }

    fn comm_error(&self, message: impl std::fmt::Display) -> DaqError {
        DaqError::communication(&self.instrument, message)
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(self.comm_error("socket not open"));
        };

        let line = format!("{}{}", command, LINE_TERMINATOR);
        let outcome = tokio::time::timeout(self.timeout, stream.get_mut().write_all(line.as_bytes()))
            .await
            .map_err(|_| self.comm_error(format!("write '{}' timed out", command)))
            .and_then(|r| r.map_err(|e| self.comm_error(format!("write '{}': {}", command, e))));
        if outcome.is_err() {
            *guard = None;
        }
        outcome?;

        debug!(instrument = %self.instrument, command, "SCPI write");
        Ok(())
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(self.comm_error("socket not open"));
        };
        let line = format!("{}{}", command, LINE_TERMINATOR);

        let exchange = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            let mut response = String::new();
            let read = stream.read_line(&mut response).await?;
            Ok::<_, std::io::Error>((read, response))
        };

        let outcome = match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => Err(self.comm_error(format!("query '{}' timed out", command))),
            Ok(Err(e)) => Err(self.comm_error(format!("query '{}': {}", command, e))),
            Ok(Ok((0, _))) => Err(self.comm_error("connection closed by instrument")),
            Ok(Ok((_, response))) => Ok(response),
        };
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                debug!(instrument = %self.instrument, command, "dropping socket after failed query");
                *guard = None;
                return Err(e);
            }
        };

        let response = response.trim().to_string();
        debug!(instrument = %self.instrument, command, %response, "SCPI query");
        Ok(response)
    }

    fn describe(&self) -> String {
        format!("socket {} ({}ms timeout)", self.endpoint, self.timeout.as_millis())
    }
}
