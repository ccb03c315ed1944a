use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use tokio::runtime::Handle;

use super::{BeaconTransport, SyncPayload, SyncTransport};
use crate::settings::TrackerSettings;

/// Confirmed delivery over HTTP POST with a JSON body.
#[derive(Clone)]
pub struct HttpSyncTransport {
    client: Client,
    endpoint: String,
}

impl HttpSyncTransport {
    pub fn new(settings: &TrackerSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(client, settings.endpoint.clone()))
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn send(&self, payload: &SyncPayload) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("sync request to {} failed", self.endpoint))?
            .error_for_status()
            .context("sync endpoint rejected batch")?;
        Ok(())
    }
}

/// Fire-and-forget delivery: spawns the POST on the runtime and returns.
#[derive(Clone)]
pub struct HttpBeacon {
    client: Client,
    endpoint: String,
    runtime: Handle,
}

impl HttpBeacon {
    /// Must be called from within a tokio runtime.
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self::with_handle(client, endpoint, Handle::current())
    }

    pub fn with_handle(client: Client, endpoint: impl Into<String>, runtime: Handle) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            runtime,
        }
    }
}

impl BeaconTransport for HttpBeacon {
    fn dispatch(&self, payload: SyncPayload) -> bool {
        let request = self.client.post(&self.endpoint).json(&payload);
        let endpoint = self.endpoint.clone();
        self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) => debug!("beacon to {endpoint} answered {}", response.status()),
                Err(err) => warn!("beacon to {endpoint} dropped: {err}"),
            }
        });
        true
    }
}
