// metrics.rs - Prometheus counters for protocol health

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub handshakes: IntCounter,
    pub handshake_failures: IntCounter,
    pub messages_received: IntCounterVec,
    pub frames_dropped: IntCounter,
    pub pings_sent: IntCounter,
    pub ping_timeouts: IntCounter,
    pub events_published: IntCounter,
    pub events_rate_limited: IntCounter,
    pub events_dispatched: IntCounter,
    pub functions_called: IntCounter,
    pub variables_read: IntCounter,
    pub chunks_ok: IntCounter,
    pub chunks_bad: IntCounter,
    pub chunk_retransmit_requests: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("emberlink".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        let messages_received = IntCounterVec::new(
            Opts::new("messages_received", "Inbound messages by classified type"),
            &["type"],
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        Ok(Self {
            handshakes: register_counter!("handshakes", "Successful handshakes"),
            handshake_failures: register_counter!("handshake_failures", "Failed handshakes"),
            messages_received,
            frames_dropped: register_counter!(
                "frames_dropped",
                "Malformed frames dropped without disconnecting"
            ),
            pings_sent: register_counter!("pings_sent", "Keep-alive pings sent"),
            ping_timeouts: register_counter!(
                "ping_timeouts",
                "Disconnects due to a missing ping acknowledgment"
            ),
            events_published: register_counter!("events_published", "Outbound events sent"),
            events_rate_limited: register_counter!(
                "events_rate_limited",
                "Outbound events denied by rate limiting"
            ),
            events_dispatched: register_counter!(
                "events_dispatched",
                "Inbound events delivered to a handler table scan"
            ),
            functions_called: register_counter!("functions_called", "Cloud function invocations"),
            variables_read: register_counter!("variables_read", "Cloud variable reads"),
            chunks_ok: register_counter!("chunks_ok", "Firmware chunks accepted"),
            chunks_bad: register_counter!("chunks_bad", "Firmware chunks failing CRC"),
            chunk_retransmit_requests: register_counter!(
                "chunk_retransmit_requests",
                "Chunk-missed retransmission requests sent"
            ),
            registry,
        })
    }

    /// Registry for scraping or pushing.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
