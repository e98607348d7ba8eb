pub mod connections;
pub mod fetch;
pub mod replicator;
pub mod streaming;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::types::{MonitoredServer, Subsystem};

use self::fetch::{RawResponse, ResponseBatch};

/// A discovered metric, one per JSON field admitted during discovery.
///
/// Gauges replace their value on every update; counters accumulate.
pub enum MetricEntry {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl MetricEntry {
    fn desc(&self) -> Vec<&Desc> {
        match self {
            MetricEntry::Gauge(m) => m.desc(),
            MetricEntry::Counter(m) => m.desc(),
        }
    }

    fn collect(&self) -> Vec<MetricFamily> {
        match self {
            MetricEntry::Gauge(m) => m.collect(),
            MetricEntry::Counter(m) => m.collect(),
        }
    }
}

/// Naming scope shared by every metric one collector instance creates:
/// namespace, endpoint (the prometheus subsystem slot) and static labels.
#[derive(Debug, Clone)]
pub struct MetricScope {
    pub namespace: String,
    pub endpoint: String,
    pub const_labels: HashMap<String, String>,
}

fn base_opts(scope: &MetricScope, name: &str, help: &str) -> Opts {
    let help = if help.is_empty() { name } else { help };
    Opts::new(name, help)
        .namespace(scope.namespace.clone())
        .subsystem(scope.endpoint.clone())
        .const_labels(scope.const_labels.clone())
}

pub(crate) fn new_gauge_vec(
    scope: &MetricScope,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec> {
    let metric = GaugeVec::new(base_opts(scope, name, help), labels)?;
    debug!(namespace = %scope.namespace, endpoint = %scope.endpoint, name, "Created gauge");
    Ok(metric)
}

pub(crate) fn new_counter_vec(
    scope: &MetricScope,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec> {
    let metric = CounterVec::new(base_opts(scope, name, help), labels)?;
    debug!(namespace = %scope.namespace, endpoint = %scope.endpoint, name, "Created counter");
    Ok(metric)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Clone the server registry with the endpoint path appended to each URL.
pub(crate) fn servers_for_endpoint(
    servers: &[MonitoredServer],
    endpoint: &str,
) -> Vec<MonitoredServer> {
    servers
        .iter()
        .map(|s| MonitoredServer {
            id: s.id.clone(),
            url: format!("{}/{}", s.url.trim_end_matches('/'), endpoint),
        })
        .collect()
}

/// Probe servers in registry order until one responds with a payload.
///
/// A refused connection means the server has not started yet and is
/// skipped quietly; other failures are reported but do not stop the probe.
pub(crate) async fn probe_first(
    client: &reqwest::Client,
    servers: &[MonitoredServer],
) -> Option<RawResponse> {
    for server in servers {
        debug!(url = %server.url, "Probing for metric discovery");
        match fetch::fetch_json(client, &server.url).await {
            Ok(payload) => return Some(payload),
            Err(e) if fetch::is_connect_error(&e) => {
                debug!(server = %server.id, "Server not reachable during discovery");
            }
            Err(e) => {
                error!(server = %server.id, error = %e, "Discovery probe failed");
            }
        }
    }
    None
}

/// Create one metric per numeric field of `payload`, keyed by field name.
///
/// Fields already present keep their existing metric object, so repeated
/// discovery passes never reset collected values. String fields are
/// treated as metadata; other non-numeric kinds are logged and skipped.
pub(crate) fn register_fields(
    stats: &mut HashMap<String, MetricEntry>,
    scope: &MetricScope,
    payload: &RawResponse,
    counter_fields: &HashSet<String>,
) {
    for (field, value) in payload {
        if stats.contains_key(field) {
            continue;
        }
        match value {
            Value::Number(n) if n.as_f64().is_some() => {
                let entry = if counter_fields.contains(field) {
                    match new_counter_vec(scope, field, "", &["server_id"]) {
                        Ok(m) => MetricEntry::Counter(m),
                        Err(e) => {
                            error!(field = %field, error = %e, "Failed to create metric");
                            continue;
                        }
                    }
                } else {
                    match new_gauge_vec(scope, field, "", &["server_id"]) {
                        Ok(m) => MetricEntry::Gauge(m),
                        Err(e) => {
                            error!(field = %field, error = %e, "Failed to create metric");
                            continue;
                        }
                    }
                };
                stats.insert(field.clone(), entry);
            }
            Value::String(_) => {} // metadata, not a metric
            other => {
                debug!(field = %field, kind = json_kind(other), "Skipping non-numeric field");
            }
        }
    }
}

/// Write each server's latest value for `field` into the metric instance
/// labeled by that server's ID. Servers absent from the batch keep their
/// previously written value.
pub(crate) fn update_entry(entry: &MetricEntry, field: &str, batch: &ResponseBatch) {
    for (id, payload) in batch {
        match payload.get(field) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_f64() {
                    match entry {
                        MetricEntry::Gauge(m) => m.with_label_values(&[id.as_str()]).set(v),
                        MetricEntry::Counter(m) => m.with_label_values(&[id.as_str()]).inc_by(v),
                    }
                }
            }
            Some(other) => {
                debug!(server = %id, field = %field, kind = json_kind(other), "Value is no longer numeric");
            }
            None => {} // server did not report this field this cycle
        }
    }
}

/// Generic collector core.
///
/// Holds one metric per numeric field discovered in the first reachable
/// server's payload, labeled by reporting server. The metric set is frozen
/// at construction; a single lock serializes describe and collect cycles
/// against the same instance.
pub struct StatusCollector {
    lock: Mutex<()>,
    stats: HashMap<String, MetricEntry>,
    servers: Vec<MonitoredServer>,
    client: reqwest::Client,
    handle: Handle,
}

impl StatusCollector {
    pub async fn new(
        client: reqwest::Client,
        scope: MetricScope,
        servers: &[MonitoredServer],
        counter_fields: &HashSet<String>,
    ) -> Self {
        let servers = servers_for_endpoint(servers, &scope.endpoint);
        let mut stats = HashMap::new();
        match probe_first(&client, &servers).await {
            Some(payload) => register_fields(&mut stats, &scope, &payload, counter_fields),
            None => {
                warn!(
                    namespace = %scope.namespace,
                    endpoint = %scope.endpoint,
                    "No server answered discovery, collector starts empty"
                );
            }
        }

        Self {
            lock: Mutex::new(()),
            stats,
            servers,
            client,
            handle: Handle::current(),
        }
    }
}

impl Collector for StatusCollector {
    fn desc(&self) -> Vec<&Desc> {
        let _cycle = self.lock.lock().unwrap();
        self.stats.values().flat_map(MetricEntry::desc).collect()
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
        for (field, entry) in &self.stats {
            update_entry(entry, field, &batch);
            families.extend(entry.collect());
        }
        families
    }
}

/// Collection strategy chosen for a (subsystem, endpoint) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    Generic,
    Connections,
    Streaming,
    Replicator,
}

impl CollectorKind {
    pub fn resolve(subsystem: Subsystem, endpoint: &str) -> Self {
        match subsystem {
            Subsystem::Core if endpoint == connections::ENDPOINT => CollectorKind::Connections,
            Subsystem::Streaming if endpoint == streaming::ENDPOINT => CollectorKind::Streaming,
            Subsystem::Replicator => CollectorKind::Replicator,
            Subsystem::Core | Subsystem::Streaming => CollectorKind::Generic,
        }
    }
}

/// Build the collector for one monitored endpoint.
///
/// Every variant exposes the same describe/collect contract, so the
/// registry treats them uniformly as boxed [`Collector`]s.
#[allow(clippy::too_many_arguments)]
pub async fn create_collector(
    client: reqwest::Client,
    subsystem: Subsystem,
    endpoint: &str,
    prefix: Option<&str>,
    static_labels: &HashMap<String, String>,
    counter_fields: &HashSet<String>,
    servers: &[MonitoredServer],
) -> Box<dyn Collector> {
    let namespace = prefix
        .filter(|p| !p.is_empty())
        .unwrap_or(subsystem.namespace())
        .to_string();
    let scope = MetricScope {
        namespace,
        endpoint: endpoint.to_string(),
        const_labels: static_labels.clone(),
    };

    match CollectorKind::resolve(subsystem, endpoint) {
        CollectorKind::Generic => {
            Box::new(StatusCollector::new(client, scope, servers, counter_fields).await)
        }
        CollectorKind::Connections => {
            Box::new(connections::ConnectionsCollector::new(client, scope, servers).await)
        }
        CollectorKind::Streaming => {
            Box::new(streaming::StreamingCollector::new(client, scope, servers, counter_fields).await)
        }
        CollectorKind::Replicator => {
            Box::new(replicator::ReplicatorCollector::new(client, scope, servers, counter_fields).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;
    use std::sync::Arc;

    fn scope() -> MetricScope {
        MetricScope {
            namespace: "server".to_string(),
            endpoint: "statusz".to_string(),
            const_labels: HashMap::new(),
        }
    }

    fn payload(value: serde_json::Value) -> RawResponse {
        value.as_object().unwrap().clone()
    }

    fn single_batch(id: &str, value: serde_json::Value) -> ResponseBatch {
        let mut batch = ResponseBatch::new();
        batch.insert(id.to_string(), payload(value));
        batch
    }

    #[test]
    fn discovery_admits_numeric_fields_only() {
        let mut stats = HashMap::new();
        register_fields(
            &mut stats,
            &scope(),
            &payload(json!({"a": 1.0, "b": "x", "c": {"d": 2}})),
            &HashSet::new(),
        );

        assert_eq!(stats.len(), 1);
        assert!(stats.contains_key("a"));
    }

    #[test]
    fn discovery_is_idempotent() {
        let mut stats = HashMap::new();
        let p = payload(json!({"connections": 3.0, "mem": 12.5}));

        register_fields(&mut stats, &scope(), &p, &HashSet::new());
        register_fields(&mut stats, &scope(), &p, &HashSet::new());

        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn rediscovery_keeps_existing_metric_objects() {
        let mut stats = HashMap::new();
        let p = payload(json!({"mem": 1.0}));

        register_fields(&mut stats, &scope(), &p, &HashSet::new());
        match &stats["mem"] {
            MetricEntry::Gauge(g) => g.with_label_values(&["s1"]).set(7.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }

        register_fields(&mut stats, &scope(), &p, &HashSet::new());
        match &stats["mem"] {
            MetricEntry::Gauge(g) => assert_eq!(g.with_label_values(&["s1"]).get(), 7.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }
    }

    #[test]
    fn gauge_replaces_and_counter_accumulates() {
        let counter_fields: HashSet<String> = HashSet::from(["total".to_string()]);
        let mut stats = HashMap::new();
        register_fields(
            &mut stats,
            &scope(),
            &payload(json!({"inflight": 5.0, "total": 5.0})),
            &counter_fields,
        );

        for values in [json!({"inflight": 5.0, "total": 5.0}), json!({"inflight": 3.0, "total": 3.0})] {
            let batch = single_batch("s1", values);
            for (field, entry) in &stats {
                update_entry(entry, field, &batch);
            }
        }

        match &stats["inflight"] {
            MetricEntry::Gauge(g) => assert_eq!(g.with_label_values(&["s1"]).get(), 3.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }
        match &stats["total"] {
            MetricEntry::Counter(c) => assert_eq!(c.with_label_values(&["s1"]).get(), 8.0),
            MetricEntry::Gauge(_) => panic!("expected counter"),
        }
    }

    #[test]
    fn non_numeric_drift_is_skipped() {
        let mut stats = HashMap::new();
        register_fields(&mut stats, &scope(), &payload(json!({"mem": 1.0})), &HashSet::new());

        let batch = single_batch("s1", json!({"mem": 2.0}));
        for (field, entry) in &stats {
            update_entry(entry, field, &batch);
        }
        // schema drift: the field turned into a string
        let batch = single_batch("s1", json!({"mem": "lots"}));
        for (field, entry) in &stats {
            update_entry(entry, field, &batch);
        }

        match &stats["mem"] {
            MetricEntry::Gauge(g) => assert_eq!(g.with_label_values(&["s1"]).get(), 2.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }
    }

    #[test]
    fn selector_maps_subsystem_and_endpoint() {
        use crate::types::Subsystem;

        assert_eq!(CollectorKind::resolve(Subsystem::Core, "statusz"), CollectorKind::Generic);
        assert_eq!(CollectorKind::resolve(Subsystem::Core, "connsz"), CollectorKind::Connections);
        assert_eq!(CollectorKind::resolve(Subsystem::Streaming, "channelsz"), CollectorKind::Streaming);
        assert_eq!(CollectorKind::resolve(Subsystem::Streaming, "statusz"), CollectorKind::Generic);
        assert_eq!(CollectorKind::resolve(Subsystem::Replicator, "anything"), CollectorKind::Replicator);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn collect_skips_unreachable_servers() {
        let up = testutil::serve_json(json!({"requests": 10.0})).await;
        let servers = vec![
            MonitoredServer { id: "up".into(), url: up },
            MonitoredServer { id: "down".into(), url: "http://127.0.0.1:1".into() },
        ];

        let client = reqwest::Client::new();
        let collector =
            Arc::new(StatusCollector::new(client, scope(), &servers, &HashSet::new()).await);

        // seed the unreachable server with a prior-cycle value
        match &collector.stats["requests"] {
            MetricEntry::Gauge(g) => g.with_label_values(&["down"]).set(42.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }

        let c = collector.clone();
        let families = tokio::task::spawn_blocking(move || Collector::collect(&*c))
            .await
            .unwrap();
        assert!(!families.is_empty());

        match &collector.stats["requests"] {
            MetricEntry::Gauge(g) => {
                assert_eq!(g.with_label_values(&["up"]).get(), 10.0);
                // stale but present, not reset to zero
                assert_eq!(g.with_label_values(&["down"]).get(), 42.0);
            }
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn total_failure_mutates_nothing_and_emits_nothing() {
        let mut stats = HashMap::new();
        register_fields(&mut stats, &scope(), &payload(json!({"requests": 1.0})), &HashSet::new());
        match &stats["requests"] {
            MetricEntry::Gauge(g) => g.with_label_values(&["s1"]).set(5.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }

        let collector = Arc::new(StatusCollector {
            lock: Mutex::new(()),
            stats,
            servers: vec![MonitoredServer {
                id: "s1".into(),
                url: "http://127.0.0.1:1/statusz".into(),
            }],
            client: reqwest::Client::new(),
            handle: Handle::current(),
        });

        let c = collector.clone();
        let families = tokio::task::spawn_blocking(move || Collector::collect(&*c))
            .await
            .unwrap();
        assert!(families.is_empty());

        match &collector.stats["requests"] {
            MetricEntry::Gauge(g) => assert_eq!(g.with_label_values(&["s1"]).get(), 5.0),
            MetricEntry::Counter(_) => panic!("expected gauge"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn discovery_falls_open_when_no_server_answers() {
        let servers = vec![MonitoredServer {
            id: "down".into(),
            url: "http://127.0.0.1:1".into(),
        }];

        let client = reqwest::Client::new();
        let collector =
            Arc::new(StatusCollector::new(client, scope(), &servers, &HashSet::new()).await);

        assert!(collector.stats.is_empty());
        assert!(Collector::desc(&*collector).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_describe_and_collect_cycles() {
        let up = testutil::serve_json(json!({"requests": 1.0})).await;
        let servers = vec![MonitoredServer { id: "s1".into(), url: up }];

        let client = reqwest::Client::new();
        let collector =
            Arc::new(StatusCollector::new(client, scope(), &servers, &HashSet::new()).await);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = collector.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                for _ in 0..10 {
                    let descs = Collector::desc(&*c);
                    assert_eq!(descs.len(), 1);
                    let families = Collector::collect(&*c);
                    assert_eq!(families.len(), 1);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
