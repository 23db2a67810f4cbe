//! DNS transports. [`DnsTransport`] is the seam between the resolver and
//! the network; [`DohTransport`] is the RFC 8484 implementation used in
//! production, POSTing `application/dns-message` over HTTPS.

use std::time::Duration;

use async_trait::async_trait;

use crate::{DnsError, DnsResult};

const CONTENT_TYPE: &str = "application/dns-message";
/// DNS over TCP/DoH messages cannot exceed a u16 length.
const MAX_MESSAGE_SIZE: u64 = 65535;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A transport that exchanges one binary DNS message for another.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn query(&self, packet: &[u8]) -> DnsResult<Vec<u8>>;
}

/// DNS-over-HTTPS transport (RFC 8484).
pub struct DohTransport {
    url: String,
    client: reqwest::Client,
}

impl DohTransport {
    /// Creates a transport for an RFC 8484 service URL. The URL must use
    /// https.
    pub fn new(url: &str) -> DnsResult<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| DnsError::InvalidName(format!("{url}: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(DnsError::InvalidName("service url must use https".into()));
        }
        let timeout = Duration::from_millis(
            std::env::var("ECH_DNS_DOH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("ech-dns/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DnsError::Transport(format!("http client: {e}")))?;
        Ok(Self {
            url: parsed.to_string(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn query_once(&self, packet: &[u8]) -> DnsResult<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", CONTENT_TYPE)
            .header("accept", CONTENT_TYPE)
            .body(packet.to_vec())
            .send()
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(DnsError::Status(status.as_u16()));
        }
        // The body is bounded by content-length; absent or oversized bodies
        // are rejected before reading.
        let size = response
            .content_length()
            .ok_or_else(|| DnsError::Decode("missing content-length".into()))?;
        if size > MAX_MESSAGE_SIZE {
            return Err(DnsError::Decode(format!("response too large: {size}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        if body.len() as u64 != size {
            return Err(DnsError::Decode("body length mismatch".into()));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl DnsTransport for DohTransport {
    /// One retry with a short backoff on transport failures; HTTP and DNS
    /// errors surface immediately.
    async fn query(&self, packet: &[u8]) -> DnsResult<Vec<u8>> {
        match self.query_once(packet).await {
            Err(DnsError::Transport(err)) => {
                tracing::debug!(target: "ech_dns::doh", %err, "retrying after transport error");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.query_once(packet).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_url() {
        assert!(matches!(
            DohTransport::new("http://1.1.1.1/dns-query"),
            Err(DnsError::InvalidName(_))
        ));
        assert!(matches!(
            DohTransport::new("not a url"),
            Err(DnsError::InvalidName(_))
        ));
        assert!(DohTransport::new("https://1.1.1.1/dns-query").is_ok());
    }
}
