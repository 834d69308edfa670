//! Query resolution engine.
//!
//! For every question the engine consults, in order:
//!
//! 1. the zone store: a claimed name is answered (or refused) locally and
//!    never leaves the gateway;
//! 2. the hosts file, for A queries nobody claimed;
//! 3. the upstream nameserver, which receives the original query and whose
//!    reply is passed back verbatim.
//!
//! AAAA queries are never forwarded, only IPv4 is supported.  The reply is
//! finally truncated to the size the client can accept.

use std::net::Ipv4Addr;
use std::sync::Arc;

use hickory_server::proto::op::{Header, Message, ResponseCode};
use hickory_server::proto::rr::rdata::A;
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use log::{debug, warn};

use crate::hosts::HostsFile;
use crate::upstream::{Exchange, Transport, UDP_MAX_MESSAGE_SIZE};
use crate::zones::{ZoneAnswer, ZoneStore};

pub struct Resolver {
    zones: Arc<ZoneStore>,
    hosts: Option<Arc<HostsFile>>,
    upstream: Arc<dyn Exchange>,
    /// Fixed upstream transport; `None` follows the serving transport.
    upstream_transport: Option<Transport>,
}

impl Resolver {
    pub fn new(
        zones: Arc<ZoneStore>,
        hosts: Option<Arc<HostsFile>>,
        upstream: Arc<dyn Exchange>,
        upstream_transport: Option<Transport>,
    ) -> Self {
        Self {
            zones,
            hosts,
            upstream,
            upstream_transport,
        }
    }

    /// Resolve `query`, received over `transport`, into a reply that fits
    /// the client's size limit.
    pub async fn resolve(&self, query: &Message, transport: Transport) -> Message {
        let reply = self.answer(query, transport).await;
        truncate(reply, max_payload(query, transport))
    }

    async fn answer(&self, query: &Message, transport: Transport) -> Message {
        let mut reply = reply_to(query);
        let mut needs_upstream = false;

        for question in query.queries() {
            let qname = question.name().to_string();
            let qtype = question.query_type();

            match self.zones.answer(&qname, qtype).await {
                ZoneAnswer::Address(ip) => {
                    debug!("{} {} answered from zone: {}", qname, qtype, ip);
                    reply.add_answer(a_record(question.name(), ip));
                    continue;
                }
                ZoneAnswer::NameError => {
                    debug!("{} {} has no zone record", qname, qtype);
                    reply.set_response_code(ResponseCode::NXDomain);
                    return reply;
                }
                ZoneAnswer::Declined => {
                    debug!("{} {} declined by zone", qname, qtype);
                    return reply;
                }
                ZoneAnswer::Unclaimed => {}
            }

            if qtype == RecordType::AAAA {
                return reply;
            }

            if qtype == RecordType::A {
                if let Some(ip) = self.hosts.as_ref().and_then(|h| h.lookup(&qname)) {
                    debug!("{} answered from hosts file: {}", qname, ip);
                    reply.add_answer(a_record(question.name(), ip));
                    continue;
                }
            }

            needs_upstream = true;
        }

        // A later question may still end in a local refusal, so the
        // upstream is only asked once every question was looked at.
        if needs_upstream {
            return self.forward(query, reply, transport).await;
        }
        reply
    }

    async fn forward(
        &self,
        query: &Message,
        mut fallback: Message,
        transport: Transport,
    ) -> Message {
        let transport = self.upstream_transport.unwrap_or(transport);
        match self.upstream.exchange(query, transport).await {
            Ok(mut reply) => {
                reply.set_id(query.id());
                reply
            }
            Err(e) => {
                warn!("Error during DNS exchange: {}", e);
                fallback.set_response_code(ResponseCode::NXDomain);
                fallback
            }
        }
    }
}

/// Empty reply carrying the query's id, opcode, flags and questions.
fn reply_to(query: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_header(Header::response_from_request(query.header()));
    reply.set_recursion_available(true);
    reply.add_queries(query.queries().to_vec());
    reply
}

fn a_record(name: &Name, ip: Ipv4Addr) -> Record {
    Record::from_rdata(name.clone(), 0, RData::A(A(ip)))
}

/// Size limit for replies to `query`: the EDNS0 advertised payload, or the
/// transport default without EDNS0.
pub fn max_payload(query: &Message, transport: Transport) -> u16 {
    match query.extensions() {
        Some(edns) => edns.max_payload().max(UDP_MAX_MESSAGE_SIZE),
        None => transport.max_message_size(),
    }
}

/// Drop records from the end of the additional, authority and answer
/// sections, in that order, until `message` encodes within `max_size` bytes.
/// The TC flag is set if anything was dropped.
pub fn truncate(mut message: Message, max_size: u16) -> Message {
    let max_size = usize::from(max_size);
    let mut dropped = false;

    while !fits(&message, max_size) {
        if !drop_last_record(&mut message) {
            break;
        }
        dropped = true;
    }

    if dropped {
        message.set_truncated(true);
    }
    message
}

fn fits(message: &Message, max_size: usize) -> bool {
    message
        .to_vec()
        .map(|bytes| bytes.len() <= max_size)
        .unwrap_or(false)
}

fn drop_last_record(message: &mut Message) -> bool {
    let mut additionals = message.take_additionals();
    if additionals.pop().is_some() {
        message.insert_additionals(additionals);
        return true;
    }

    let mut name_servers = message.take_name_servers();
    if name_servers.pop().is_some() {
        message.insert_name_servers(name_servers);
        return true;
    }

    let mut answers = message.take_answers();
    let popped = answers.pop().is_some();
    message.insert_answers(answers);
    popped
}
