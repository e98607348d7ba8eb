pub mod collector;
pub mod config;
pub mod exporter;
pub mod identity;

#[cfg(test)]
pub mod testutil;

/// Common types used across modules
pub mod types {
    use serde::Deserialize;

    /// A monitored server instance polled by the exporter.
    ///
    /// The same physical server may appear in several collectors, each
    /// holding its own copy with the endpoint path appended to the URL.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MonitoredServer {
        pub id: String,
        pub url: String,
    }

    /// Monitored subsystem family. Together with the endpoint name this
    /// determines which collection strategy is instantiated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Subsystem {
        Core,
        Streaming,
        Replicator,
    }

    impl Subsystem {
        /// Metric namespace used when no prefix override is configured
        pub fn namespace(&self) -> &'static str {
            match self {
                Subsystem::Core => "server",
                Subsystem::Streaming => "streaming",
                Subsystem::Replicator => "replicator",
            }
        }
    }

    impl std::fmt::Display for Subsystem {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let s = match self {
                Subsystem::Core => "core",
                Subsystem::Streaming => "streaming",
                Subsystem::Replicator => "replicator",
            };
            write!(f, "{}", s)
        }
    }
}
