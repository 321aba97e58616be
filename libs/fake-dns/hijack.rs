use std::net::IpAddr;

use etc_hosts::Hosts;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};

use crate::pool::{FakeIpPool, PoolError};

/// Answers, in place of any real resolver, DNS queries intercepted on port 53.
///
/// A queries resolve to fake IPs (or hosts-file entries, which win); AAAA
/// queries are served from the hosts file when an IPv6 entry exists and are
/// otherwise left empty so clients retry over A. Single-label names get
/// NXDOMAIN, which keeps hijack-detection probes quiet.
pub struct Hijacker {
    pool: FakeIpPool,
    hosts: Hosts,
}

impl Hijacker {
    pub fn new(fake_range: &str, hosts: Hosts) -> Result<Self, PoolError> {
        Ok(Self {
            pool: FakeIpPool::new(fake_range)?,
            hosts,
        })
    }

    pub fn pool(&self) -> &FakeIpPool {
        &self.pool
    }

    /// Answers `payload` if it parses as a DNS message.
    ///
    /// Returns the wire-format response, or `None` when the payload is not
    /// DNS and should be passed through (with the consumed bytes replayed).
    pub fn try_answer(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let query = Message::from_vec(payload).ok()?;

        let response = self.answer(&query);

        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to serialize hijacked DNS response: {e}");
                None
            }
        }
    }

    fn answer(&self, query: &Message) -> Message {
        let mut response = reply_to(query);

        for question in query.queries() {
            let name = question.name().clone();
            let host = name.to_utf8();
            let host = host.trim_end_matches('.');

            if let Some(rdata) = self.hosts_record(question.query_type(), host) {
                tracing::debug!(%host, "Answering hijacked query from hosts file");
                response.add_answer(Record::from_rdata(name, 0, rdata));
                continue;
            }

            match question.query_type() {
                RecordType::A => {
                    if !host.contains('.') {
                        // Single labels are a telltale of hijack-detection scans.
                        tracing::debug!(%host, "Refusing single-label query");
                        let mut failed = reply_to(query);
                        failed.set_response_code(ResponseCode::NXDomain);
                        return failed;
                    }

                    let ip = self.pool.lookup(host);
                    tracing::debug!(%host, %ip, "Answering hijacked query with fake IP");
                    response.add_answer(Record::from_rdata(name, 0, RData::A(ip.into())));
                }
                _ => {
                    // Empty NOERROR; the client falls back to A.
                }
            }
        }

        response
    }

    fn hosts_record(&self, query_type: RecordType, host: &str) -> Option<RData> {
        self.hosts.lookup(host).iter().find_map(|ip| match (query_type, ip) {
            (RecordType::A, IpAddr::V4(ip)) => Some(RData::A((*ip).into())),
            (RecordType::AAAA, IpAddr::V6(ip)) => Some(RData::AAAA((*ip).into())),
            _ => None,
        })
    }

    pub fn reverse_lookup(&self, ip: std::net::Ipv4Addr) -> Option<String> {
        self.pool.reverse_lookup(ip)
    }
}

fn reply_to(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_authoritative(true);

    for question in query.queries() {
        response.add_query(question.clone());
    }

    response
}
