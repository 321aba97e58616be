//! The covert resolver chain: a coalescing TTL cache in front of DoH-over-relay
//! with an optional plain-UDP fallback, plus a small UDP server exposing the
//! chain on a local address.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cache;
mod doh;
mod server;
mod udp;

pub use cache::CachingResolver;
pub use doh::DohHandler;
pub use server::Server;
pub use udp::UdpHandler;

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

pub const DEFAULT_DOH_PROVIDER: &str = "rubyfish.cn:443";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("lookup: no such host")]
    NoSuchHost,
    #[error("lookup timed out")]
    LookupTimeout,
    #[error("upstream failure: {0}")]
    Upstream(String),
}

/// One link in the resolver chain.
///
/// Implemented by the upstream handlers and by the cache itself, which
/// composes a list of them behind the same interface.
#[async_trait]
pub trait DnsHandler: Send + Sync {
    async fn lookup(&self, query: &Message) -> Result<Message, ResolveError>;

    /// A short tag for log lines.
    fn name(&self) -> String;
}

/// Resolves `host` to its first address record via `handler`.
pub async fn resolve_host(handler: &dyn DnsHandler, host: &str) -> Result<IpAddr, ResolveError> {
    let name = Name::from_utf8(host).map_err(|_| ResolveError::NoSuchHost)?;

    let mut query = Message::new();
    query.set_id(rand::random());
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(name, RecordType::A));

    let response = handler.lookup(&query).await?;

    response
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .ok_or(ResolveError::NoSuchHost)
}

/// Overwrites the TTL of every answer record.
pub(crate) fn set_answer_ttls(message: &mut Message, ttl: u32) {
    let answers = message
        .take_answers()
        .into_iter()
        .map(|mut record| {
            record.set_ttl(ttl);
            record
        })
        .collect();

    message.insert_answers(answers);
}

/// The TTL of the first answer record, the basis for cache expiry.
pub(crate) fn first_answer_ttl(message: &Message) -> u32 {
    message.answers().first().map(|r| r.ttl()).unwrap_or_default()
}
