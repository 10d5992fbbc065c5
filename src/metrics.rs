use once_cell::sync::Lazy;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

// Registered into the default registry; the host process decides how (and
// whether) to expose it.

static CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_cache_hits",
        "client-side cache lookups served locally"
    ))
    .expect("cache hit counter registration must succeed")
});

static CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_cache_misses",
        "client-side cache lookups that issued a server fetch"
    ))
    .expect("cache miss counter registration must succeed")
});

static CACHE_INVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_cache_invalidations",
        "cache entries dropped by server invalidation pushes"
    ))
    .expect("cache invalidation counter registration must succeed")
});

static WIRE_CONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_wire_connects",
        "wires dialed since process start"
    ))
    .expect("wire connect counter registration must succeed")
});

static WIRE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_wire_failures",
        "wires torn down by I/O or protocol faults"
    ))
    .expect("wire failure counter registration must succeed")
});

static WIRES_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("pipefish_wires_open", "currently open wires"))
        .expect("wire gauge registration must succeed")
});

static REDIRECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "pipefish_cluster_redirects",
            "cluster redirects followed, by kind"
        ),
        &["kind"]
    )
    .expect("redirect counter registration must succeed")
});

static SLOT_REFRESHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "pipefish_slot_refreshes",
        "successful slot table refreshes"
    ))
    .expect("slot refresh counter registration must succeed")
});

pub fn cache_hit() {
    CACHE_HITS.inc();
}

pub fn cache_miss() {
    CACHE_MISSES.inc();
}

pub fn cache_invalidate(count: usize) {
    CACHE_INVALIDATIONS.inc_by(count as u64);
}

pub fn wire_connect() {
    WIRE_CONNECTS.inc();
    WIRES_OPEN.inc();
}

pub fn wire_close() {
    WIRES_OPEN.dec();
}

pub fn wire_failure() {
    WIRE_FAILURES.inc();
}

pub fn redirect_moved() {
    REDIRECTS.with_label_values(&["moved"]).inc();
}

pub fn redirect_ask() {
    REDIRECTS.with_label_values(&["ask"]).inc();
}

pub fn slot_refresh() {
    SLOT_REFRESHES.inc();
}
