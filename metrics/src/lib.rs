use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("flotilla"));

/// Records the elapsed wall-clock time into a histogram when dropped.
pub struct Timer<'a> {
    start: Instant,
    histogram: &'a Histogram<f64>,
    labels: &'a [KeyValue],
}

impl<'a> Timer<'a> {
    pub fn start(histogram: &'a Histogram<f64>) -> Self {
        Self::start_with_labels(histogram, &[])
    }

    pub fn start_with_labels(histogram: &'a Histogram<f64>, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }
}

impl<'a> Drop for Timer<'a> {
    fn drop(&mut self) {
        self.histogram
            .record(self.start.elapsed().as_secs_f64(), self.labels);
    }
}

pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub kv_events: Counter<u64>,
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        Self {
            state_write: METER
                .f64_histogram("flotilla_state_write_duration")
                .with_unit("s")
                .with_description("Time to apply a soft-state write")
                .build(),
            kv_events: METER
                .u64_counter("flotilla_kv_events")
                .with_description("KV watch events applied to local soft state")
                .build(),
        }
    }
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReconcilerMetrics {
    pub sweep_duration: Histogram<f64>,
    pub nodes_skipped: Counter<u64>,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self {
            sweep_duration: METER
                .f64_histogram("flotilla_reconcile_sweep_duration")
                .with_unit("s")
                .with_description("Time to reconcile container inventory across the fleet")
                .build(),
            nodes_skipped: METER
                .u64_counter("flotilla_reconcile_nodes_skipped")
                .with_description("Nodes skipped during a reconcile sweep because they were unreachable")
                .build(),
        }
    }
}

impl Default for ReconcilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UpdateJobMetrics {
    pub job_duration: Histogram<f64>,
    pub containers_updated: Counter<u64>,
    pub rollbacks: Counter<u64>,
}

impl UpdateJobMetrics {
    pub fn new() -> Self {
        Self {
            job_duration: METER
                .f64_histogram("flotilla_update_job_duration")
                .with_unit("s")
                .with_description("Time to run an update job to completion")
                .build(),
            containers_updated: METER
                .u64_counter("flotilla_containers_updated")
                .with_description("Containers recreated by update jobs")
                .build(),
            rollbacks: METER
                .u64_counter("flotilla_update_rollbacks")
                .with_description("Update jobs that triggered a rollback replay")
                .build(),
        }
    }
}

impl Default for UpdateJobMetrics {
    fn default() -> Self {
        Self::new()
    }
}
