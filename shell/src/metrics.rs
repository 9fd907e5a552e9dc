//! Prometheus gauges for shell internals.

use lazy_static::lazy_static;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

lazy_static! {
    pub static ref PENDING_PROBES: Gauge = Default::default();
    pub static ref FANOUTS_IN_FLIGHT: Gauge = Default::default();
    pub static ref EVENTS_QUEUE_SIZE: Gauge = Default::default();
}

pub fn register_metrics(registry: &mut Registry) {
    registry.register(
        "pending_probes",
        "Probes awaiting a response or timeout",
        PENDING_PROBES.clone(),
    );
    registry.register(
        "fanouts_in_flight",
        "Ping-request fan-outs awaiting a decisive outcome",
        FANOUTS_IN_FLIGHT.clone(),
    );
    registry.register(
        "events_queue_size",
        "Membership change events queued for the embedder",
        EVENTS_QUEUE_SIZE.clone(),
    );
}
