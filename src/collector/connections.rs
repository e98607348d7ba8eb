//! Connection-listing variant.
//!
//! The connection endpoint reports an array of per-connection objects next
//! to its top-level stats. Instead of one metric instance per server, the
//! array is flattened into one instance per connection, labeled by the
//! reporting server and the connection ID.

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
    new_gauge_vec, probe_first, register_fields, servers_for_endpoint, update_entry, MetricEntry,
    MetricScope,
};

pub const ENDPOINT: &str = "connsz";

const LIST_FIELD: &str = "connections";
const ID_FIELD: &str = "cid";

/// Collector for the connection-listing endpoint.
pub struct ConnectionsCollector {
    lock: Mutex<()>,
    /// Top-level numeric fields, labeled `[server_id]`
    top_level: HashMap<String, MetricEntry>,
    /// Per-connection numeric fields, labeled `[server_id, cid]`
    per_conn: HashMap<String, MetricEntry>,
    servers: Vec<MonitoredServer>,
    client: reqwest::Client,
    handle: Handle,
}

impl ConnectionsCollector {
    pub(crate) async fn new(
        client: reqwest::Client,
        scope: MetricScope,
        servers: &[MonitoredServer],
    ) -> Self {
        let servers = servers_for_endpoint(servers, ENDPOINT);
        let mut top_level = HashMap::new();
        let mut per_conn = HashMap::new();

        match probe_first(&client, &servers).await {
            Some(payload) => {
                register_fields(&mut top_level, &scope, &payload, &HashSet::new());
                register_connection_fields(&mut per_conn, &scope, &payload);
            }
            None => {
                warn!(
                    namespace = %scope.namespace,
                    "No server answered connection discovery, collector starts empty"
                );
            }
        }

        Self {
            lock: Mutex::new(()),
            top_level,
            per_conn,
            servers,
            client,
            handle: Handle::current(),
        }
    }
}

/// Inspect the first array entry to learn the per-connection field set.
/// Per-connection metrics carry a `conn_` name prefix so they cannot
/// collide with a top-level field of the same name.
fn register_connection_fields(
    stats: &mut HashMap<String, MetricEntry>,
    scope: &MetricScope,
    payload: &RawResponse,
) {
    let Some(Value::Array(conns)) = payload.get(LIST_FIELD) else {
        debug!(field = LIST_FIELD, "No connection array in discovery payload");
        return;
    };
    let Some(Value::Object(first)) = conns.first() else {
        debug!(field = LIST_FIELD, "Connection array empty during discovery");
        return;
    };

    for (field, value) in first {
        if field == ID_FIELD || stats.contains_key(field) {
            continue;
        }
        if let Value::Number(n) = value {
            if n.as_f64().is_some() {
                let name = format!("conn_{}", field);
                match new_gauge_vec(scope, &name, "", &["server_id", ID_FIELD]) {
                    Ok(m) => {
                        stats.insert(field.clone(), MetricEntry::Gauge(m));
                    }
                    Err(e) => {
                        warn!(field = %field, error = %e, "Failed to create connection metric");
                    }
                }
            }
        }
    }
}

/// Write one labeled value per connection reported by each server.
/// Entries without a numeric `cid` cannot be labeled and are skipped.
fn update_connection_entry(entry: &MetricEntry, field: &str, batch: &ResponseBatch) {
    for (id, payload) in batch {
        let Some(Value::Array(conns)) = payload.get(LIST_FIELD) else {
            continue;
        };
        for conn in conns {
            let Value::Object(conn) = conn else { continue };
            let cid = match conn.get(ID_FIELD) {
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    debug!(server = %id, "Connection entry without a numeric cid");
                    continue;
                }
            };
            if let Some(Value::Number(n)) = conn.get(field) {
                if let Some(v) = n.as_f64() {
                    match entry {
                        MetricEntry::Gauge(m) => {
                            m.with_label_values(&[id.as_str(), cid.as_str()]).set(v)
                        }
                        MetricEntry::Counter(m) => {
                            m.with_label_values(&[id.as_str(), cid.as_str()]).inc_by(v)
                        }
                    }
                }
            }
        }
    }
}

impl Collector for ConnectionsCollector {
    fn desc(&self) -> Vec<&Desc> {
        let _cycle = self.lock.lock().unwrap();
        self.top_level
            .values()
            .chain(self.per_conn.values())
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
        for (field, entry) in &self.per_conn {
            update_connection_entry(entry, field, &batch);
            families.extend(entry.collect());
        }
        families
    }
}
