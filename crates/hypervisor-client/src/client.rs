//! Hypervisor API client
//!
//! Talks to the node-local hypervisor API:
//! - `GET /v1/domains` and `GET /v1/domains/{name}` for domain state
//! - `GET /v1/events/cursor` and `GET /v1/events?after=N&wait=S` (long poll)
//!   for lifecycle events

use crate::error::HypervisorError;
use crate::hypervisor_trait::HypervisorClientTrait;
use crate::models::{DomainEvent, DomainInfo, DomainList, EventBatch, EventCursor};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side wait of one event poll; stays below `REQUEST_TIMEOUT`.
const EVENT_POLL_WAIT_SECS: u64 = 20;
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Consecutive poll failures after which a subscription gives up.
const MAX_POLL_FAILURES: u32 = 5;
const POLL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Hypervisor API client
pub struct HypervisorClient {
    client: Client,
    base_url: String,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for HypervisorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorClient")
            .field("base_url", &self.base_url)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HypervisorClient {
    /// Create a new hypervisor client
    ///
    /// # Arguments
    /// * `base_url` - Hypervisor API URL (e.g., "http://127.0.0.1:16510")
    pub fn new(base_url: String) -> Result<Self, HypervisorError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dispatchers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), HypervisorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HypervisorError::Disconnected("client closed".to_string()));
        }
        Ok(())
    }
}

/// GET `url` and decode the JSON body, mapping 404 to `NotFound`.
async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, HypervisorError> {
    debug!("GET {}", url);
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = response.status();
    if status == 404 {
        return Err(HypervisorError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(HypervisorError::Api(format!("{url}: {status} - {body}")));
    }

    let text = response.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Event dispatch loop of one subscription.
///
/// Ends when the receiver is dropped or after `MAX_POLL_FAILURES` consecutive
/// poll failures; either way the channel closes.
async fn dispatch_events(
    client: Client,
    base_url: String,
    mut cursor: u64,
    tx: mpsc::Sender<DomainEvent>,
) {
    let mut failures = 0u32;
    loop {
        let url = format!("{base_url}/v1/events?after={cursor}&wait={EVENT_POLL_WAIT_SECS}");
        let batch = tokio::select! {
            () = tx.closed() => {
                debug!("Lifecycle subscriber went away, stopping dispatch");
                return;
            }
            res = get_json::<EventBatch>(&client, &url) => res,
        };

        match batch {
            Ok(batch) => {
                failures = 0;
                for raw in batch.events {
                    let seq = raw.seq;
                    let Some(event) = raw.into_event() else {
                        debug!(seq, "Skipping lifecycle event with unknown code");
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                cursor = batch.cursor;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_POLL_FAILURES {
                    warn!(error = %e, failures, "Lifecycle event subscription lost");
                    return;
                }
                warn!(error = %e, failures, "Lifecycle event poll failed, retrying");
                tokio::time::sleep(POLL_RETRY_DELAY * failures).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl HypervisorClientTrait for HypervisorClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ping(&self) -> Result<(), HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}/v1/events/cursor", self.base_url);
        get_json::<EventCursor>(&self.client, &url).await?;
        debug!("Hypervisor API reachable");
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}/v1/domains", self.base_url);
        let list: DomainList = get_json(&self.client, &url).await?;
        Ok(list.domains)
    }

    async fn get_domain(&self, name: &str) -> Result<DomainInfo, HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}/v1/domains/{}", self.base_url, name);
        match get_json(&self.client, &url).await {
            Err(HypervisorError::NotFound(_)) => {
                Err(HypervisorError::NotFound(format!("domain {name}")))
            }
            other => other,
        }
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>, HypervisorError> {
        self.ensure_open()?;
        let url = format!("{}/v1/events/cursor", self.base_url);
        let EventCursor { cursor } = get_json(&self.client, &url).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(dispatch_events(
            self.client.clone(),
            self.base_url.clone(),
            cursor,
            tx,
        ));

        let mut dispatchers = self.dispatchers.lock().unwrap_or_else(PoisonError::into_inner);
        dispatchers.retain(|h| !h.is_finished());
        dispatchers.push(handle);
        info!(cursor, "Subscribed to domain lifecycle events");
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dispatchers = std::mem::take(
            &mut *self.dispatchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in dispatchers {
            handle.abort();
        }
        info!("Hypervisor connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = HypervisorClient::new("http://127.0.0.1:16510/".to_string()).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:16510");
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = HypervisorClient::new("http://127.0.0.1:16510".to_string()).unwrap();
        client.close().await;

        assert!(matches!(
            client.list_domains().await,
            Err(HypervisorError::Disconnected(_))
        ));
        assert!(matches!(
            client.subscribe_lifecycle().await,
            Err(HypervisorError::Disconnected(_))
        ));
    }
}
