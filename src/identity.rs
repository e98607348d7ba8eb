//! Server identity resolution.
//!
//! Every monitored server reports a stable ID on its status endpoint. The
//! ID labels every metric the server contributes, so the exporter cannot
//! do anything useful without it: transient fetch failures are retried
//! indefinitely, while a payload without a valid ID fails immediately as
//! a configuration error.

use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::collector::fetch;

/// Well-known endpoint every monitored server reports its identity on
pub const STATUS_ENDPOINT: &str = "statusz";

const ID_FIELD: &str = "server_id";

/// Resolve the server's stable ID from its status endpoint.
///
/// Makes one immediate attempt, then retries on `retry_interval` until the
/// server answers or `shutdown` fires. Liveness of the monitored server is
/// the supervisor's problem, not ours, so the loop itself never gives up.
pub async fn resolve_server_id(
    client: &reqwest::Client,
    base_url: &str,
    retry_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<String> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), STATUS_ENDPOINT);

    loop {
        match fetch::fetch_json(client, &url).await {
            Ok(payload) => match payload.get(ID_FIELD) {
                Some(Value::String(id)) => return Ok(id.clone()),
                Some(other) => bail!("Invalid {} type in {}: {}", ID_FIELD, url, other),
                None => bail!("Could not find {} in {}", ID_FIELD, url),
            },
            Err(e) => {
                warn!(url = %url, error = %e, "Could not resolve server id, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_interval) => {}
            _ = shutdown.changed() => {
                bail!("Shutdown requested while resolving server id for {}", base_url);
            }
        }
    }
}
