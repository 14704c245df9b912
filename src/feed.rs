use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Settings, SharedSettings};
use crate::error::{Error, Result};
use crate::store::{NewSsh, Store};

/// Field separators accepted by the SSH text grammar
const SEPARATORS: [char; 3] = [';', ',', '|'];

/// Parse one line of SSH text:
/// `<ipv4> [<sep> <ssh_port>] <sep> <username> <sep> <password>`
/// with any of `;`, `,`, `|` as separator. Returns `None` for lines that do
/// not match; those are skipped silently by the callers.
pub fn parse_ssh_line(line: &str) -> Option<NewSsh> {
    let fields: Vec<&str> = line
        .split(|c| SEPARATORS.contains(&c))
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect();

    let (ip, ssh_port, username, password) = match fields.as_slice() {
        [ip, username, password] => (*ip, 22, *username, *password),
        [ip, port, username, password] => (*ip, port.parse().ok()?, *username, *password),
        _ => return None,
    };

    ip.parse::<Ipv4Addr>().ok()?;

    Some(NewSsh {
        ip: ip.to_string(),
        username: username.to_string(),
        password: password.to_string(),
        ssh_port,
    })
}

/// Parse a whole SSH text body, capping the result at `limit` records.
pub fn parse_ssh_body(body: &str, limit: usize) -> Vec<NewSsh> {
    let mut records = Vec::new();
    for line in body.lines() {
        if records.len() >= limit {
            break;
        }
        if let Some(record) = parse_ssh_line(line) {
            records.push(record);
        }
    }
    records
}

/// Background loop pulling fresh SSH records from the external store feed.
///
/// While enabled, fetches the feed text every `sshstore_interval` seconds
/// and inserts whatever is not already present. Failures are logged at
/// debug and silently retried next interval.
pub struct FeedIngester {
    store: Store,
    settings: SharedSettings,
    client: reqwest::Client,
}

impl FeedIngester {
    pub fn new(store: Store, settings: SharedSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            store,
            settings,
            client,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let (enabled, interval, url, limit) = {
                let settings = self.settings.read().await;
                (
                    settings.sshstore_enabled,
                    settings.sshstore_interval.max(1),
                    feed_url(&settings),
                    settings.sshstore_limit,
                )
            };

            if enabled {
                match self.ingest_once(&url, limit).await {
                    Ok(inserted) if inserted > 0 => {
                        info!("Inserted {inserted} SSH records from the store feed");
                    }
                    Ok(_) => {}
                    Err(err) => debug!("Feed fetch failed: {err}"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_secs(interval)) => {}
            }
        }
    }

    async fn ingest_once(&self, url: &str, limit: usize) -> Result<usize> {
        let body = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Feed(e.to_string()))?
            .text()
            .await
            .map_err(|e| Error::Feed(e.to_string()))?;

        let records = parse_ssh_body(&body, limit);
        self.store.insert_ssh_batch(&records).await
    }
}

fn feed_url(settings: &Settings) -> String {
    format!(
        "http://autossh.top/api/txt/{}/{}/",
        settings.sshstore_api_key, settings.sshstore_country
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_field_line() {
        let record = parse_ssh_line("1.2.3.4|root|toor").unwrap();
        assert_eq!(record.ip, "1.2.3.4");
        assert_eq!(record.ssh_port, 22);
        assert_eq!(record.username, "root");
        assert_eq!(record.password, "toor");
    }

    #[test]
    fn test_parse_four_field_line_with_port() {
        let record = parse_ssh_line("1.2.3.4;2222;root;toor").unwrap();
        assert_eq!(record.ssh_port, 2222);
    }

    #[test]
    fn test_parse_mixed_separators_and_spaces() {
        let record = parse_ssh_line("1.2.3.4 , root | toor").unwrap();
        assert_eq!(record.username, "root");
        assert_eq!(record.password, "toor");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_ssh_line("").is_none());
        assert!(parse_ssh_line("not an ip|root|toor").is_none());
        assert!(parse_ssh_line("1.2.3.4|root").is_none());
        assert!(parse_ssh_line("1.2.3.4|notaport|root|toor").is_none());
        assert!(parse_ssh_line("1.2.3.4|1|2|3|4").is_none());
        assert!(parse_ssh_line("# comment line").is_none());
    }

    #[test]
    fn test_parse_body_skips_garbage_and_caps() {
        let body = "1.1.1.1|a|b\ngarbage\n2.2.2.2|c|d\n3.3.3.3|e|f\n";

        let all = parse_ssh_body(body, 100);
        assert_eq!(all.len(), 3);

        let capped = parse_ssh_body(body, 2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn test_ingesting_same_body_twice_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("feed.db")).await.unwrap();
        let records = parse_ssh_body("1.1.1.1|a|b\n2.2.2.2|c|d\n", 100);

        assert_eq!(store.insert_ssh_batch(&records).await.unwrap(), 2);
        assert_eq!(store.insert_ssh_batch(&records).await.unwrap(), 0);
        assert_eq!(store.list_ssh_ids().await.unwrap().len(), 2);
    }
}
