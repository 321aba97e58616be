use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{DnsHandler, ResolveError, first_answer_ttl, set_answer_ttls};

const CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(1 << 16).unwrap();

/// How long a caller waits for an in-flight lookup before giving up. The
/// fetch itself keeps running and wakes any remaining waiters.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A coalescing TTL cache over an ordered list of upstream handlers.
///
/// Per key there is at most one in-flight upstream fetch; concurrent callers
/// park on one-shot channels and all observe the same answer (or error). A
/// finished entry whose expiry has passed is demoted back to in-flight by the
/// first caller that notices.
#[derive(Clone)]
pub struct CachingResolver {
    shared: Arc<Shared>,
}

struct Shared {
    upstreams: Vec<Arc<dyn DnsHandler>>,
    state: Mutex<LruCache<String, Entry>>,
}

#[derive(Default)]
struct Entry {
    finished: bool,
    answer: Option<CachedAnswer>,
    waiters: Vec<oneshot::Sender<CachedAnswer>>,
}

#[derive(Clone)]
struct CachedAnswer {
    result: Result<Message, ResolveError>,
    expires_at: Instant,
}

impl CachingResolver {
    pub fn new(upstreams: Vec<Arc<dyn DnsHandler>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstreams,
                state: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            }),
        }
    }

    async fn lookup_coalesced(&self, query: &Message) -> Result<Message, ResolveError> {
        let key = cache_key(query);
        let now = Instant::now();

        let (waiter, launch_fetch) = {
            let mut state = self.shared.state.lock();

            match state.get_mut(&key) {
                Some(entry) if entry.finished => {
                    match entry.answer.clone() {
                        Some(answer) if answer.expires_at > now => {
                            return deliver(answer, now);
                        }
                        _ => {
                            // Expired: demote to in-flight and refetch.
                            entry.finished = false;
                            entry.answer = None;

                            let (tx, rx) = oneshot::channel();
                            entry.waiters.push(tx);
                            (rx, true)
                        }
                    }
                }
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    (rx, false)
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.put(
                        key.clone(),
                        Entry {
                            waiters: vec![tx],
                            ..Entry::default()
                        },
                    );
                    (rx, true)
                }
            }
        };

        if launch_fetch {
            let shared = self.shared.clone();
            let query = query.clone();
            tokio::spawn(async move { fetch(shared, key, query).await });
        }

        match tokio::time::timeout(WAIT_TIMEOUT, waiter).await {
            Ok(Ok(answer)) => deliver(answer, Instant::now()),
            // The entry was evicted from the LRU mid-flight.
            Ok(Err(_closed)) => Err(ResolveError::Upstream(
                "resolver cache entry evicted".to_owned(),
            )),
            Err(_elapsed) => Err(ResolveError::LookupTimeout),
        }
    }
}

async fn fetch(shared: Arc<Shared>, key: String, query: Message) {
    let mut result = Err(ResolveError::NoSuchHost);

    for upstream in &shared.upstreams {
        match upstream.lookup(&query).await {
            Ok(message) => {
                tracing::debug!(key = %key, via = %upstream.name(), "Resolved");
                result = Ok(message);
                break;
            }
            Err(e) => {
                tracing::warn!(key = %key, via = %upstream.name(), "Upstream lookup failed: {e}");
                result = Err(e);
            }
        }
    }

    let expires_at = match &result {
        Ok(message) => {
            Instant::now() + Duration::from_secs(u64::from(first_answer_ttl(message)))
        }
        // Errors are delivered to the current waiters and expire on the spot.
        Err(_) => Instant::now(),
    };

    let answer = CachedAnswer { result, expires_at };

    let waiters = {
        let mut state = shared.state.lock();

        let Some(entry) = state.get_mut(&key) else {
            return; // Evicted mid-flight; nobody left to tell.
        };

        entry.finished = true;
        entry.answer = Some(answer.clone());

        std::mem::take(&mut entry.waiters)
    };

    for waiter in waiters {
        let _ = waiter.send(answer.clone());
    }
}

/// Rewrites the answer's TTLs to the remaining lifetime and hands it out.
fn deliver(answer: CachedAnswer, now: Instant) -> Result<Message, ResolveError> {
    let mut message = answer.result?;

    let remaining = answer.expires_at.saturating_duration_since(now);
    let mut seconds = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        seconds += 1;
    }

    set_answer_ttls(&mut message, u32::try_from(seconds).unwrap_or(u32::MAX));

    Ok(message)
}

fn cache_key(query: &Message) -> String {
    query
        .queries()
        .iter()
        .map(|q| format!("{} {} {}", q.name(), q.query_class(), q.query_type()))
        .collect::<Vec<_>>()
        .join(";")
}

#[async_trait]
impl DnsHandler for CachingResolver {
    async fn lookup(&self, query: &Message) -> Result<Message, ResolveError> {
        self.lookup_coalesced(query).await
    }

    fn name(&self) -> String {
        "[CACHE]".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    use super::*;
    use crate::resolve_host;

    const UPSTREAM_DELAY: Duration = Duration::from_millis(200);

    struct StubUpstream {
        calls: AtomicUsize,
        ip: Ipv4Addr,
        ttl: u32,
        fail: bool,
    }

    impl StubUpstream {
        fn new(ip: Ipv4Addr, ttl: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ip,
                ttl,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ip: Ipv4Addr::LOCALHOST,
                ttl: 0,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DnsHandler for StubUpstream {
        async fn lookup(&self, query: &Message) -> Result<Message, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(UPSTREAM_DELAY).await;

            if self.fail {
                return Err(ResolveError::Upstream("stub is down".to_owned()));
            }

            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(hickory_proto::op::MessageType::Response);
            response.set_response_code(ResponseCode::NoError);
            for q in query.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(
                    q.name().clone(),
                    self.ttl,
                    RData::A(self.ip.into()),
                ));
            }

            Ok(response)
        }

        fn name(&self) -> String {
            "STUB".to_owned()
        }
    }

    fn a_query(host: &str) -> Message {
        let mut query = Message::new();
        query.set_id(1);
        query.add_query(Query::query(Name::from_str(host).unwrap(), RecordType::A));

        query
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_concurrent_lookups_into_one_upstream_call() {
        let upstream = StubUpstream::new(Ipv4Addr::new(93, 184, 216, 34), 300);
        let resolver = CachingResolver::new(vec![upstream.clone()]);

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolve_host(&resolver, "example.com").await
            }));
        }

        for task in tasks {
            let ip = task.await.unwrap().unwrap();
            assert_eq!(ip, Ipv4Addr::new(93, 184, 216, 34));
        }

        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_triggers_exactly_one_refetch() {
        let upstream = StubUpstream::new(Ipv4Addr::new(93, 184, 216, 34), 300);
        let resolver = CachingResolver::new(vec![upstream.clone()]);

        resolve_host(&resolver, "example.com").await.unwrap();
        assert_eq!(upstream.calls(), 1);

        // Still fresh.
        tokio::time::advance(Duration::from_secs(100)).await;
        resolve_host(&resolver, "example.com").await.unwrap();
        assert_eq!(upstream.calls(), 1);

        // Past the 300 s TTL now.
        tokio::time::advance(Duration::from_secs(300)).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolve_host(&resolver, "example.com").await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_replies_carry_the_remaining_ttl() {
        let upstream = StubUpstream::new(Ipv4Addr::new(93, 184, 216, 34), 300);
        let resolver = CachingResolver::new(vec![upstream]);

        let query = a_query("example.com.");
        resolver.lookup(&query).await.unwrap();

        tokio::time::advance(Duration::from_secs(100)).await;
        let response = resolver.lookup(&query).await.unwrap();

        assert_eq!(first_answer_ttl(&response), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_is_shared_with_all_waiters_once() {
        let upstream = StubUpstream::failing();
        let resolver = CachingResolver::new(vec![upstream.clone()]);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolve_host(&resolver, "example.com").await
            }));
        }

        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(ResolveError::Upstream(_))
            ));
        }
        assert_eq!(upstream.calls(), 1);

        // The error is not cached beyond delivery; the next caller refetches.
        resolve_host(&resolver, "example.com").await.unwrap_err();
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_upstream_is_tried_after_the_first_fails() {
        let broken = StubUpstream::failing();
        let working = StubUpstream::new(Ipv4Addr::new(203, 0, 113, 1), 60);
        let resolver = CachingResolver::new(vec![broken.clone(), working.clone()]);

        let ip = resolve_host(&resolver, "example.com").await.unwrap();

        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(broken.calls(), 1);
        assert_eq!(working.calls(), 1);
    }

    struct NeverReturns;

    #[async_trait]
    impl DnsHandler for NeverReturns {
        async fn lookup(&self, _: &Message) -> Result<Message, ResolveError> {
            std::future::pending().await
        }

        fn name(&self) -> String {
            "NEVER".to_owned()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_time_out_after_ten_seconds() {
        let resolver = CachingResolver::new(vec![Arc::new(NeverReturns)]);

        let result = resolve_host(&resolver, "example.com").await;

        assert!(matches!(result, Err(ResolveError::LookupTimeout)));
    }
}
