//! Upstream nameserver client.
//!
//! Exchanges a complete DNS message with the configured upstream over UDP or
//! TCP.  The transport is chosen per call, there is no shared mutable client
//! state between the UDP and TCP request paths.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_server::proto::error::ProtoError;
use hickory_server::proto::op::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Duration;

/// Largest message a UDP client must accept without EDNS (RFC 1035).
pub const UDP_MAX_MESSAGE_SIZE: u16 = 512;
/// TCP messages are bounded only by the two byte length prefix.
pub const TCP_MAX_MESSAGE_SIZE: u16 = u16::MAX;

/// Network transport of a DNS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Reply size limit when the client did not advertise one via EDNS0.
    pub fn max_message_size(self) -> u16 {
        match self {
            Transport::Udp => UDP_MAX_MESSAGE_SIZE,
            Transport::Tcp => TCP_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("invalid upstream message: {0}")]
    Proto(#[from] ProtoError),
    #[error("upstream reply id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },
}

/// Sends a query to an upstream server and returns its reply.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, query: &Message, transport: Transport)
        -> Result<Message, UpstreamError>;
}

/// A single upstream nameserver reached over plain DNS.
#[derive(Debug, Clone)]
pub struct Upstream {
    server: SocketAddr,
    timeout: Duration,
}

impl Upstream {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn exchange_udp(&self, request: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;
        socket.send(request).await?;

        let mut buf = vec![0u8; usize::from(TCP_MAX_MESSAGE_SIZE)];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(&self, request: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let len = u16::try_from(request.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "query too large for TCP")
        })?;

        let mut stream = TcpStream::connect(self.server).await?;
        stream.write_u16(len).await?;
        stream.write_all(request).await?;
        stream.flush().await?;

        let len = stream.read_u16().await?;
        let mut buf = vec![0u8; usize::from(len)];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl Exchange for Upstream {
    async fn exchange(
        &self,
        query: &Message,
        transport: Transport,
    ) -> Result<Message, UpstreamError> {
        let request = query.to_vec()?;
        let exchange = async {
            match transport {
                Transport::Udp => self.exchange_udp(&request).await,
                Transport::Tcp => self.exchange_tcp(&request).await,
            }
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))??;

        let reply = Message::from_vec(&raw)?;
        if reply.id() != query.id() {
            return Err(UpstreamError::IdMismatch {
                expected: query.id(),
                got: reply.id(),
            });
        }
        Ok(reply)
    }
}

/// First nameserver from the system resolver configuration.
pub fn system_nameserver() -> anyhow::Result<SocketAddr> {
    let (config, _opts) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| anyhow::anyhow!("Failed to read system resolver configuration: {}", e))?;
    config
        .name_servers()
        .first()
        .map(|ns| ns.socket_addr)
        .ok_or_else(|| anyhow::anyhow!("No nameserver found in system resolver configuration"))
}
