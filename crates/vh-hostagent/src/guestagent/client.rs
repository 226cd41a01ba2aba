//! Guest agent client

use std::fmt;
use std::io;
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use vh_protocol::{GuestEvent, GuestInfo, GuestRequest, JsonLinesCodec, ProtocolError};

/// Where the guest agent is reached from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Host end of a unix socket forwarded into the guest
    Unix(PathBuf),
    /// Direct virtual socket to the VM
    Vsock { cid: u32, port: u32 },
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Unix(path) => write!(f, "unix://{}", path.display()),
            Transport::Vsock { cid, port } => write!(f, "vsock://{}:{}", cid, port),
        }
    }
}

/// Guest agent client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to guest agent at {transport}: {source}")]
    Connect {
        transport: String,
        #[source]
        source: io::Error,
    },

    #[error("Guest agent protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The agent hung up before answering
    #[error("Guest agent closed the connection")]
    Closed,

    #[error("Cancelled")]
    Cancelled,
}

trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

type Conn = Box<dyn Connection>;

/// Live subscription to the guest event stream
pub struct EventStream {
    framed: Framed<Conn, JsonLinesCodec<GuestEvent>>,
}

impl EventStream {
    /// Next event, or `None` once the agent closes the stream
    pub async fn next(&mut self) -> Option<Result<GuestEvent, ClientError>> {
        self.framed
            .next()
            .await
            .map(|item| item.map_err(ClientError::from))
    }
}

/// Speaks the JSON-lines protocol to the guest agent
///
/// Each call opens a fresh connection; the agent serves one request per
/// connection.
#[derive(Debug, Clone)]
pub struct GuestAgentClient {
    transport: Transport,
}

impl GuestAgentClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Query the listeners currently open in the guest
    pub async fn info(&self, cancel: &CancellationToken) -> Result<GuestInfo, ClientError> {
        let query = async {
            let mut framed = self.request::<GuestInfo>(GuestRequest::Info).await?;
            match framed.next().await {
                Some(info) => Ok(info?),
                None => Err(ClientError::Closed),
            }
        };

        tokio::select! {
            result = query => result,
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    /// Open the event subscription
    pub async fn subscribe(&self) -> Result<EventStream, ClientError> {
        let framed = self.request::<GuestEvent>(GuestRequest::Events).await?;
        Ok(EventStream { framed })
    }

    async fn request<D: DeserializeOwned>(
        &self,
        request: GuestRequest,
    ) -> Result<Framed<Conn, JsonLinesCodec<D>>, ClientError> {
        let mut framed = Framed::new(self.connect().await?, JsonLinesCodec::<D>::new());
        framed.send(request).await?;
        Ok(framed)
    }

    async fn connect(&self) -> Result<Conn, ClientError> {
        let conn = match &self.transport {
            Transport::Unix(path) => UnixStream::connect(path)
                .await
                .map(|stream| Box::new(stream) as Conn),
            Transport::Vsock { cid, port } => connect_vsock(*cid, *port).await,
        };
        conn.map_err(|source| ClientError::Connect {
            transport: self.transport.to_string(),
            source,
        })
    }
}

#[cfg(target_os = "linux")]
async fn connect_vsock(cid: u32, port: u32) -> io::Result<Conn> {
    let stream = super::vsock::VsockStream::connect(cid, port).await?;
    Ok(Box::new(stream))
}

#[cfg(not(target_os = "linux"))]
async fn connect_vsock(_cid: u32, _port: u32) -> io::Result<Conn> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock is only available on Linux",
    ))
}
