//! Replication variant.
//!
//! Replicator processes expose the same flat status payload as the core
//! subsystem, always on the status endpoint, and their throughput totals
//! are monotonic. The variant reuses the generic core with the endpoint
//! pinned and the well-known totals admitted as counters.

use std::collections::HashSet;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;

use crate::types::MonitoredServer;

use super::{MetricScope, StatusCollector};

pub const ENDPOINT: &str = "statusz";

/// Totals a replicator reports that accumulate across its lifetime.
const COUNTER_FIELDS: &[&str] = &["requests", "responses", "errors"];

/// Collector for replication processes.
pub struct ReplicatorCollector {
    inner: StatusCollector,
}

impl ReplicatorCollector {
    pub(crate) async fn new(
        client: reqwest::Client,
        mut scope: MetricScope,
        servers: &[MonitoredServer],
        extra_counters: &HashSet<String>,
    ) -> Self {
        scope.endpoint = ENDPOINT.to_string();

        let mut counter_fields: HashSet<String> =
            COUNTER_FIELDS.iter().map(|s| s.to_string()).collect();
        counter_fields.extend(extra_counters.iter().cloned());

        Self {
            inner: StatusCollector::new(client, scope, servers, &counter_fields).await,
        }
    }
}

impl Collector for ReplicatorCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.inner.collect()
    }
}
