use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::time::{Instant, Sleep};

/// Throttles a response body to `rate` bytes per second with a token bucket
/// whose size equals the rate.
///
/// A mirror that serves at wire speed stops looking like a mirror; the cap
/// keeps the decoy's traffic profile plausible.
pub struct RateLimited<B> {
    inner: B,
    rate: u64,
    /// Bytes handed out beyond what the bucket has re-earned.
    debt: u64,
    refilled_at: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<B> RateLimited<B> {
    pub fn new(inner: B, rate: u64) -> Self {
        Self {
            inner,
            rate: rate.max(1),
            debt: 0,
            refilled_at: Instant::now(),
            sleep: None,
        }
    }

    fn account(&mut self, len: usize) {
        let now = Instant::now();
        let earned = (now.duration_since(self.refilled_at).as_secs_f64() * self.rate as f64) as u64;
        self.refilled_at = now;

        self.debt = self.debt.saturating_sub(earned) + len as u64;

        if self.debt > self.rate {
            let wait = Duration::from_secs_f64((self.debt - self.rate) as f64 / self.rate as f64);
            self.sleep = Some(Box::pin(tokio::time::sleep(wait)));
        }
    }
}

impl<B> Body for RateLimited<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(sleep) = this.sleep.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }

        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        if let Some(Ok(frame)) = &frame
            && let Some(data) = frame.data_ref()
        {
            this.account(data.len());
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::stream;
    use http_body_util::{BodyExt as _, StreamBody};

    use super::*;

    fn chunked_body(
        chunks: usize,
        chunk_size: usize,
    ) -> impl Body<Data = Bytes, Error = Infallible> + Unpin {
        StreamBody::new(stream::iter(
            std::iter::repeat_n(Bytes::from(vec![0u8; chunk_size]), chunks)
                .map(|chunk| Ok(Frame::data(chunk))),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn large_bodies_drain_at_the_configured_rate() {
        // 10 KiB at 1 KiB/s: everything beyond the initial bucket has to wait,
        // so the drain takes at least (10 - 1) KiB / 1 KiB/s = 9 s.
        let body = RateLimited::new(chunked_body(10, 1024), 1024);

        let started_at = Instant::now();
        body.collect().await.unwrap();
        let elapsed = started_at.elapsed();

        assert!(elapsed >= Duration::from_secs(9), "drained in {elapsed:?}");
        assert!(elapsed < Duration::from_secs(12), "drained in {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn small_bodies_pass_within_the_bucket() {
        let body = RateLimited::new(chunked_body(4, 128), 1024);

        let started_at = Instant::now();
        body.collect().await.unwrap();

        assert_eq!(started_at.elapsed(), Duration::ZERO);
    }
}
