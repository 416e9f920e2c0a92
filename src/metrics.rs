use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};

lazy_static! {
    pub static ref LOOKUPS_TOTAL: Counter =
        register_counter!("hoverflag_lookups_total", "Location lookups dispatched to the bridge").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("hoverflag_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("hoverflag_cache_misses_total", "Total cache misses").unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("hoverflag_rate_limited_total", "Lookups answered with a rate limit").unwrap();
    pub static ref FLAGS_INSERTED: Counter =
        register_counter!("hoverflag_flags_inserted_total", "Flag spans written into hover cards").unwrap();
    pub static ref LOOKUP_LATENCY: Histogram = register_histogram!(
        "hoverflag_lookup_latency_seconds",
        "Bridge round-trip latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("hoverflag_cache_size", "Current number of cached locations").unwrap();
}
