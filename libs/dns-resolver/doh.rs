use async_trait::async_trait;
use dialer::TunnelHttpClient;
use hickory_proto::op::Message;

use crate::{DnsHandler, ResolveError, set_answer_ttls};

const CONTENT_TYPE: &str = "application/dns-message";

/// DNS over HTTPS, with the HTTP leg riding the relay tunnel so that name
/// resolution itself cannot be censored.
pub struct DohHandler {
    provider: String,
    client: TunnelHttpClient,
    /// Overrides upstream TTLs, so answers survive despite the relay hop.
    static_ttl: Option<u32>,
}

impl DohHandler {
    pub fn new(provider: impl Into<String>, client: TunnelHttpClient, static_ttl: Option<u32>) -> Self {
        Self {
            provider: provider.into(),
            client,
            static_ttl,
        }
    }
}

#[async_trait]
impl DnsHandler for DohHandler {
    async fn lookup(&self, query: &Message) -> Result<Message, ResolveError> {
        let payload = query
            .to_vec()
            .map_err(|e| ResolveError::Upstream(format!("failed to encode query: {e}")))?;

        let url = format!("https://{}/dns-query", self.provider);
        let response = self
            .client
            .post(
                &url,
                &[("content-type", CONTENT_TYPE), ("accept", CONTENT_TYPE)],
                payload.into(),
            )
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;

        if response.status() != http::StatusCode::OK {
            return Err(ResolveError::Upstream(format!(
                "provider failure with status code: {}",
                response.status()
            )));
        }

        let mut answer = Message::from_vec(response.body())
            .map_err(|e| ResolveError::Upstream(format!("failed to decode answer: {e}")))?;

        if let Some(ttl) = self.static_ttl {
            set_answer_ttls(&mut answer, ttl);
        }

        Ok(answer)
    }

    fn name(&self) -> String {
        format!(
            "HTTPS[upstream: {}, ttl: {:?}]",
            self.provider, self.static_ttl
        )
    }
}
