//! Prometheus registries shared across the reconciliation engine and admission
//! pipeline. Mirrors the teacher's `once_cell::sync::Lazy` + `register_*!`
//! idiom rather than threading a metrics handle through every component.

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_counter, register_gauge, register_histogram,
    register_int_counter_vec, Counter, Gauge, Histogram, IntCounterVec,
};

pub static READY: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("relay_ready", "1 if the relay is ready to admit requests").unwrap());

pub static SUCCESSFUL_ROUNDS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "relay_successful_rounds",
        "Consecutive successful reconciliation ticks"
    )
    .unwrap()
});

pub static TICK_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "relay_tick_latency_seconds",
        "Wall time of a single reconciliation tick",
        exponential_buckets(0.01, 2.0, 16).unwrap()
    )
    .unwrap()
});

pub static TXS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relay_txs_submitted_total",
        "Transactions submitted by server action",
        &["action"]
    )
    .unwrap()
});

pub static TXS_BOOSTED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("relay_txs_boosted_total", "Transactions re-submitted at a higher gas price").unwrap()
});

pub static RELAY_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relay_requests_total",
        "Admission pipeline outcomes",
        &["outcome"]
    )
    .unwrap()
});
