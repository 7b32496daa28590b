use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    pub kind: String,
}

/// Session counters exported in Prometheus text format.
#[derive(Debug)]
pub struct SessionMetrics {
    registry: Registry,
    outcomes: Family<OutcomeLabels, Counter>,
    rejections: Family<RejectLabels, Counter>,
    created: Counter,
    torn_down: Counter,
    in_flight: Gauge,
    queued: Gauge,
    peak_in_flight: AtomicI64,
    duration_ms: Histogram,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub torn_down: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub limit_exceeded: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub in_flight: i64,
    pub queued: i64,
    pub peak_in_flight: i64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("codecell");
        let outcomes = Family::<OutcomeLabels, Counter>::default();
        let rejections = Family::<RejectLabels, Counter>::default();
        let created = Counter::default();
        let torn_down = Counter::default();
        let in_flight = Gauge::default();
        let queued = Gauge::default();
        let duration_ms = Histogram::new(exponential_buckets(10.0, 2.0, 14));

        registry.register(
            "session_outcomes",
            "Sessions finished, by termination reason",
            outcomes.clone(),
        );
        registry.register(
            "requests_rejected",
            "Requests rejected before a session was created, by error kind",
            rejections.clone(),
        );
        registry.register("sessions_created", "Sandboxes allocated", created.clone());
        registry.register("sessions_torn_down", "Sandboxes reclaimed", torn_down.clone());
        registry.register("sessions_in_flight", "Sessions holding a slot", in_flight.clone());
        registry.register("requests_queued", "Requests waiting for a slot", queued.clone());
        registry.register(
            "session_duration_ms",
            "Wall-clock time of the command sequence",
            duration_ms.clone(),
        );

        Self {
            registry,
            outcomes,
            rejections,
            created,
            torn_down,
            in_flight,
            queued,
            peak_in_flight: AtomicI64::new(0),
            duration_ms,
        }
    }

    pub fn session_created(&self) {
        self.created.inc();
        let now = self.in_flight.inc() + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    pub fn session_finished(&self, reason: &str, elapsed_ms: u64) {
        self.outcomes
            .get_or_create(&OutcomeLabels {
                reason: reason.to_string(),
            })
            .inc();
        self.duration_ms.observe(elapsed_ms as f64);
    }

    pub fn session_torn_down(&self) {
        self.torn_down.inc();
        self.in_flight.dec();
    }

    pub fn rejected(&self, kind: &str) {
        self.rejections
            .get_or_create(&RejectLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn queue_entered(&self) -> i64 {
        self.queued.inc()
    }

    pub fn queue_left(&self) {
        self.queued.dec();
    }

    fn outcome(&self, reason: &str) -> u64 {
        self.outcomes
            .get_or_create(&OutcomeLabels {
                reason: reason.to_string(),
            })
            .get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.get(),
            torn_down: self.torn_down.get(),
            completed: self.outcome("completed"),
            timed_out: self.outcome("timeout"),
            limit_exceeded: self.outcome("resource-limit"),
            errored: self.outcome("internal-error"),
            cancelled: self.outcome("cancelled"),
            rejected: [
                "unknown_language",
                "invalid_source",
                "invalid_request",
                "overloaded",
                "cancelled",
            ]
            .iter()
            .map(|kind| {
                self.rejections
                    .get_or_create(&RejectLabels {
                        kind: kind.to_string(),
                    })
                    .get()
            })
            .sum(),
            in_flight: self.in_flight.get(),
            queued: self.queued.get(),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Err(e) = encode(&mut out, &self.registry) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        out
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
