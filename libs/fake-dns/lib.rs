//! Fake-IP DNS: a bijective hostname ↔ synthetic-IPv4 allocator and the port-53
//! hijacker that answers intercepted queries out of it.
//!
//! Handing out a fake IP per hostname lets the host route table steer every
//! flow onto the TUN device; the outbound side later recovers the hostname via
//! [`FakeIpPool::reverse_lookup`] and resolves it over the covert channel.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod hijack;
mod pool;

pub use hijack::Hijacker;
pub use pool::{FakeIpPool, PoolError};
