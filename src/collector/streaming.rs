//! Streaming-subsystem variant.
//!
//! Streaming servers report one object per channel. The channel array is
//! flattened into one metric instance per channel, labeled by the
//! reporting server and the channel name. Delivery totals can be declared
//! as counters via the target's `counter_fields`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::types::MonitoredServer;

use super::fetch::{self, RawResponse, ResponseBatch};
use super::{
    new_counter_vec, new_gauge_vec, probe_first, register_fields, servers_for_endpoint,
    update_entry, MetricEntry, MetricScope,
};

pub const ENDPOINT: &str = "channelsz";

const LIST_FIELD: &str = "channels";
const NAME_FIELD: &str = "name";

/// Collector for the streaming channel endpoint.
pub struct StreamingCollector {
    lock: Mutex<()>,
    /// Top-level numeric fields, labeled `[server_id]`
    top_level: HashMap<String, MetricEntry>,
    /// Per-channel numeric fields, labeled `[server_id, channel]`
    per_channel: HashMap<String, MetricEntry>,
    servers: Vec<MonitoredServer>,
    client: reqwest::Client,
    handle: Handle,
}

impl StreamingCollector {
    pub(crate) async fn new(
        client: reqwest::Client,
        scope: MetricScope,
        servers: &[MonitoredServer],
        counter_fields: &HashSet<String>,
    ) -> Self {
        let servers = servers_for_endpoint(servers, ENDPOINT);
        let mut top_level = HashMap::new();
        let mut per_channel = HashMap::new();

        match probe_first(&client, &servers).await {
            Some(payload) => {
                register_fields(&mut top_level, &scope, &payload, counter_fields);
                register_channel_fields(&mut per_channel, &scope, &payload, counter_fields);
            }
            None => {
                warn!(
                    namespace = %scope.namespace,
                    "No server answered channel discovery, collector starts empty"
                );
            }
        }

        Self {
            lock: Mutex::new(()),
            top_level,
            per_channel,
            servers,
            client,
            handle: Handle::current(),
        }
    }
}

/// Learn the per-channel field set from the first array entry. Channel
/// metrics carry a `channel_` name prefix to stay clear of top-level
/// fields of the same name.
fn register_channel_fields(
    stats: &mut HashMap<String, MetricEntry>,
    scope: &MetricScope,
    payload: &RawResponse,
    counter_fields: &HashSet<String>,
) {
    let Some(Value::Array(channels)) = payload.get(LIST_FIELD) else {
        debug!(field = LIST_FIELD, "No channel array in discovery payload");
        return;
    };
    let Some(Value::Object(first)) = channels.first() else {
        debug!(field = LIST_FIELD, "Channel array empty during discovery");
        return;
    };

    for (field, value) in first {
        if field == NAME_FIELD || stats.contains_key(field) {
            continue;
        }
        let Value::Number(n) = value else { continue };
        if n.as_f64().is_none() {
            continue;
        }

        let name = format!("channel_{}", field);
        let labels = ["server_id", "channel"];
        let entry = if counter_fields.contains(field) {
            new_counter_vec(scope, &name, "", &labels).map(MetricEntry::Counter)
        } else {
            new_gauge_vec(scope, &name, "", &labels).map(MetricEntry::Gauge)
        };
        match entry {
            Ok(entry) => {
                stats.insert(field.clone(), entry);
            }
            Err(e) => {
                warn!(field = %field, error = %e, "Failed to create channel metric");
            }
        }
    }
}

/// Write one labeled value per channel reported by each server. Channels
/// without a string name cannot be labeled and are skipped.
fn update_channel_entry(entry: &MetricEntry, field: &str, batch: &ResponseBatch) {
    for (id, payload) in batch {
        let Some(Value::Array(channels)) = payload.get(LIST_FIELD) else {
            continue;
        };
        for channel in channels {
            let Value::Object(channel) = channel else { continue };
            let name = match channel.get(NAME_FIELD) {
                Some(Value::String(name)) => name,
                _ => {
                    debug!(server = %id, "Channel entry without a name");
                    continue;
                }
            };
            if let Some(Value::Number(n)) = channel.get(field) {
                if let Some(v) = n.as_f64() {
                    match entry {
                        MetricEntry::Gauge(m) => {
                            m.with_label_values(&[id.as_str(), name.as_str()]).set(v)
                        }
                        MetricEntry::Counter(m) => {
                            m.with_label_values(&[id.as_str(), name.as_str()]).inc_by(v)
                        }
                    }
                }
            }
        }
    }
}

impl Collector for StreamingCollector {
    fn desc(&self) -> Vec<&Desc> {
        let _cycle = self.lock.lock().unwrap();
        self.top_level
            .values()
            .chain(self.per_channel.values())
            .flat_map(MetricEntry::desc)
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _cycle = self.lock.lock().unwrap();
        let batch = self
            .handle
            .block_on(fetch::fetch_all(&self.client, &self.servers));
        if batch.is_empty() {
            return Vec::new();
        }

        let mut families = Vec::new();
        for (field, entry) in &self.top_level {
            update_entry(entry, field, &batch);
            families.extend(entry.collect());
        }
        for (field, entry) in &self.per_channel {
            update_channel_entry(entry, field, &batch);
            families.extend(entry.collect());
        }
        families
    }
}
