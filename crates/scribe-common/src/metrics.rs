//! Metrics for Scribe replication health
//!
//! Provides OpenTelemetry metrics for:
//! - Whether a volume is out of sync with its schedule
//! - Sync intervals that were missed entirely
//! - Sync duration distribution
//!
//! Every series is labelled by the identity of the ReplicationSource plus its
//! role and method, so a `SyncMetrics` handle built per reconcile pass writes
//! to the same series each time for the same object.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for Scribe metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("scribe"));

// ============================================================================
// Instruments
// ============================================================================

/// Gauge set to 1 while a volume has missed its sync window
///
/// Labels:
/// - `obj_name`, `obj_namespace`: the ReplicationSource
/// - `role`: source
/// - `method`: rsync, rclone, restic
pub static VOLUME_OUT_OF_SYNC: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("scribe_volume_out_of_sync")
        .with_description("Set to 1 if the volume is not properly synchronized")
        .build()
});

/// Counter of sync intervals that passed without a completed sync
pub static MISSED_INTERVALS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("scribe_missed_intervals_total")
        .with_description("The number of times a synchronization failed to complete before the next scheduled start")
        .with_unit("{intervals}")
        .build()
});

/// Histogram of sync durations
pub static SYNC_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("scribe_sync_duration_seconds")
        .with_description("Duration of the synchronization interval in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Which side of a replication relationship an object plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that reads the volume and pushes it out
    Source,
}

impl Role {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
        }
    }
}

/// Identity a set of series is keyed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsKey {
    /// ReplicationSource name
    pub name: String,
    /// ReplicationSource namespace
    pub namespace: String,
    /// Replication role
    pub role: Role,
    /// Mover method (rsync, rclone, restic)
    pub method: String,
}

impl MetricsKey {
    /// Label set for this key
    pub fn labels(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("obj_name", self.name.clone()),
            KeyValue::new("obj_namespace", self.namespace.clone()),
            KeyValue::new("role", self.role.as_str()),
            KeyValue::new("method", self.method.clone()),
        ]
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Per-object handle over the global instruments.
///
/// Cheap to build; holds only the label set.
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    key: MetricsKey,
    labels: Vec<KeyValue>,
}

impl SyncMetrics {
    /// Bind the instruments to one object's identity
    pub fn new(key: MetricsKey) -> Self {
        let labels = key.labels();
        Self { key, labels }
    }

    /// The identity these series are keyed by
    pub fn key(&self) -> &MetricsKey {
        &self.key
    }

    /// Raise or clear the out-of-sync gauge
    pub fn set_out_of_sync(&self, out_of_sync: bool) {
        VOLUME_OUT_OF_SYNC.record(i64::from(out_of_sync), &self.labels);
    }

    /// Count one missed interval
    pub fn inc_missed_intervals(&self) {
        MISSED_INTERVALS.add(1, &self.labels);
    }

    /// Record how long a sync took
    pub fn observe_sync_duration(&self, seconds: f64) {
        SYNC_DURATION.record(seconds, &self.labels);
    }
}
