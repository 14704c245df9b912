use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Echo services answering with the caller's public IP in plain text.
/// Later entries are fallbacks tried before a retry is consumed.
const ECHO_ENDPOINTS: [&str; 2] = ["https://api.ipify.org?format=text", "https://ip.seeip.org"];

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Egress-IP prober for SOCKS5 proxies
#[derive(Debug, Clone)]
pub struct IpProber {
    /// Per-request timeout, independent for each attempt
    request_timeout: Duration,
}

impl Default for IpProber {
    fn default() -> Self {
        Self::new(10)
    }
}

impl IpProber {
    /// Create a new prober with the specified per-request timeout
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            request_timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Fetch the egress IP observed through `proxy_url`
    /// (`socks5://<host>:<port>`).
    ///
    /// Returns the trimmed response body, or an empty string once `tries`
    /// attempts across all echo endpoints have failed.
    pub async fn probe(&self, proxy_url: &str, tries: u32) -> String {
        let client = match self.client_for(proxy_url) {
            Ok(client) => client,
            Err(e) => {
                debug!("Invalid proxy address {proxy_url}: {e}");
                return String::new();
            }
        };

        for attempt in 0..tries.max(1) {
            if attempt > 0 {
                sleep(RETRY_PAUSE).await;
            }

            for endpoint in ECHO_ENDPOINTS {
                match self.fetch(&client, endpoint).await {
                    Ok(ip) if !ip.is_empty() => return ip,
                    Ok(_) => debug!("Empty probe body from {endpoint} via {proxy_url}"),
                    Err(e) => debug!("Probe via {proxy_url} against {endpoint} failed: {e}"),
                }
            }
        }

        String::new()
    }

    fn client_for(&self, proxy_url: &str) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy_url)?)
            .timeout(self.request_timeout)
            .build()
    }

    async fn fetch(&self, client: &reqwest::Client, endpoint: &str) -> reqwest::Result<String> {
        let body = client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }
}
