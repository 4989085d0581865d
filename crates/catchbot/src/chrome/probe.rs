//! Liveness probe for the browser's remote debugging endpoint.

use async_trait::async_trait;
use std::time::Duration;

/// Answers "is something listening on the debug port?".
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Bounded-time check; any failure or timeout means "not reachable".
    async fn is_reachable(&self, port: u16, timeout: Duration) -> bool;
}

/// HTTP GET against `http://localhost:<port>`; any response counts.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointProbe for HttpProbe {
    async fn is_reachable(&self, port: u16, timeout: Duration) -> bool {
        let url = format!("http://localhost:{port}");
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => {
                tracing::trace!(port, status = resp.status().as_u16(), "debug endpoint answered");
                true
            }
            Err(e) => {
                tracing::trace!(port, error = %e, "debug endpoint probe failed");
                false
            }
        }
    }
}
