//! DNS server subsystem.
//!
//! This module implements the UDP/TCP front end using the
//! [hickory-dns](https://crates.io/crates/hickory-server) library.  Every
//! datagram and every TCP connection is handled on its own task; the
//! request is turned back into a [`Message`] and handed to the
//! [`Resolver`](crate::resolver::Resolver), whose reply is written back
//! unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, Message, ResponseCode};
use hickory_server::server::{
    Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::resolver::Resolver;
use crate::upstream::Transport;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the DNS server.
pub async fn run_dns_server(bind_addr: SocketAddr, resolver: Arc<Resolver>) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let udp = UdpSocket::bind(bind_addr).await?;
    let tcp = TcpListener::bind(bind_addr).await?;
    serve(udp, tcp, resolver).await
}

/// Serve queries on already bound sockets until they fail.
pub async fn serve(
    udp: UdpSocket,
    tcp: TcpListener,
    resolver: Arc<Resolver>,
) -> anyhow::Result<()> {
    let mut server = ServerFuture::new(GatewayDns { resolver });
    server.register_socket(udp);
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

struct GatewayDns {
    resolver: Arc<Resolver>,
}

/// Rebuild the client's query from the parsed request.
///
/// The server hands over a single question per request, so the rebuilt
/// message carries exactly one.
fn to_message(request: &Request) -> Message {
    let mut message = Message::new();
    message.set_header(*request.header());
    message.add_query(request.query().original().clone());
    if let Some(edns) = request.edns() {
        message.set_edns(edns.clone());
    }
    message
}

#[async_trait]
impl RequestHandler for GatewayDns {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let transport = match request.protocol() {
            Protocol::Udp => Transport::Udp,
            _ => Transport::Tcp,
        };
        let query = to_message(request);
        let reply = self.resolver.resolve(&query, transport).await;

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = reply.extensions().clone() {
            builder.edns(edns);
        }
        let response = builder.build(
            *reply.header(),
            reply.answers().iter(),
            reply.name_servers().iter(),
            std::iter::empty(),
            reply.additionals().iter(),
        );

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response to {}: {}", request.src(), e);
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
