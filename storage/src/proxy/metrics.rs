use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;

pub struct Metrics {
    pub hits: Counter,
    pub partial_hits: Counter,
    pub misses: Counter,
    pub inserts_clean: Counter,
    pub inserts_dirty: Counter,
    pub evictions: Counter,
    pub writebacks: Counter,
    pub writeback_failures: Counter,
    pub invalidations: Counter,
    pub files: Gauge,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub(crate) fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            hits: Counter::default(),
            partial_hits: Counter::default(),
            misses: Counter::default(),
            inserts_clean: Counter::default(),
            inserts_dirty: Counter::default(),
            evictions: Counter::default(),
            writebacks: Counter::default(),
            writeback_failures: Counter::default(),
            invalidations: Counter::default(),
            files: Gauge::default(),
        };

        registry.register(
            "hits",
            "Number of lookups fully served from the cache",
            metrics.hits.clone(),
        );
        registry.register(
            "partial_hits",
            "Number of lookups partially served from the cache",
            metrics.partial_hits.clone(),
        );
        registry.register(
            "misses",
            "Number of lookups with nothing cached",
            metrics.misses.clone(),
        );
        registry.register(
            "inserts_clean",
            "Number of clean inserts",
            metrics.inserts_clean.clone(),
        );
        registry.register(
            "inserts_dirty",
            "Number of dirty inserts",
            metrics.inserts_dirty.clone(),
        );
        registry.register(
            "evictions",
            "Number of cached files removed from disk",
            metrics.evictions.clone(),
        );
        registry.register(
            "writebacks",
            "Number of dirty extents written back",
            metrics.writebacks.clone(),
        );
        registry.register(
            "writeback_failures",
            "Number of failed or short write-backs",
            metrics.writeback_failures.clone(),
        );
        registry.register(
            "invalidations",
            "Number of invalidated ranges",
            metrics.invalidations.clone(),
        );
        registry.register("files", "Number of cached files", metrics.files.clone());

        metrics
    }
}
