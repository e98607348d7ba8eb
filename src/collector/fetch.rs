//! HTTP retrieval of per-server status payloads.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::types::MonitoredServer;

/// A single server's decoded status payload, scoped to one round trip.
pub type RawResponse = Map<String, Value>;

/// Responses for the current cycle, keyed by server ID.
///
/// A server whose fetch failed is absent from the map rather than present
/// with an empty payload, so metric updates skip it without zeroing its
/// last written value.
pub type ResponseBatch = HashMap<String, RawResponse>;

/// Fetch one monitoring URL and decode the body as a JSON object.
pub async fn fetch_json(client: &reqwest::Client, url: &str) -> Result<RawResponse> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", url))?
        .error_for_status()
        .with_context(|| format!("Bad status from {}", url))?;

    let payload = resp
        .json::<RawResponse>()
        .await
        .with_context(|| format!("Invalid JSON from {}", url))?;

    Ok(payload)
}

/// Fetch every server's payload for the current cycle. Failures are
/// isolated per server: the offender is logged and omitted from the batch.
pub async fn fetch_all(client: &reqwest::Client, servers: &[MonitoredServer]) -> ResponseBatch {
    let mut batch = ResponseBatch::new();
    for server in servers {
        match fetch_json(client, &server.url).await {
            Ok(payload) => {
                batch.insert(server.id.clone(), payload);
            }
            Err(e) => {
                debug!(server = %server.id, error = %e, "Ignoring server for this cycle");
            }
        }
    }
    batch
}

/// True if the error chain bottoms out in a failed connection attempt,
/// which during discovery means "server not started yet".
pub(crate) fn is_connect_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_connect())
    })
}
