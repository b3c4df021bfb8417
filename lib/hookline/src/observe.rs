//! Policy counters through the `metrics` facade (`metrics` feature).
//!
//! Without the feature every function compiles to nothing.

#[cfg(feature = "metrics")]
mod enabled {
    const LABEL_RESULT: &str = "result";

    const METRIC_CACHE_LOOKUPS: &str = "hookline_cache_lookups_total";
    const METRIC_CACHE_EVICTIONS: &str = "hookline_cache_evictions_total";
    const METRIC_RATE_LIMITED: &str = "hookline_rate_limited_total";
    const METRIC_DEDUPE_JOINED: &str = "hookline_dedupe_joined_total";
    const METRIC_RETRIES: &str = "hookline_retries_total";
    const METRIC_REFRESHES: &str = "hookline_token_refreshes_total";

    pub(crate) fn cache_lookup(hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        metrics::counter!(METRIC_CACHE_LOOKUPS, LABEL_RESULT => result).increment(1);
    }

    pub(crate) fn cache_eviction() {
        metrics::counter!(METRIC_CACHE_EVICTIONS).increment(1);
    }

    pub(crate) fn rate_limited() {
        metrics::counter!(METRIC_RATE_LIMITED).increment(1);
    }

    pub(crate) fn dedupe_joined() {
        metrics::counter!(METRIC_DEDUPE_JOINED).increment(1);
    }

    pub(crate) fn retry() {
        metrics::counter!(METRIC_RETRIES).increment(1);
    }

    pub(crate) fn token_refresh(success: bool) {
        let result = if success { "success" } else { "failure" };
        metrics::counter!(METRIC_REFRESHES, LABEL_RESULT => result).increment(1);
    }
}

#[cfg(not(feature = "metrics"))]
mod enabled {
    pub(crate) fn cache_lookup(_hit: bool) {}
    pub(crate) fn cache_eviction() {}
    pub(crate) fn rate_limited() {}
    pub(crate) fn dedupe_joined() {}
    pub(crate) fn retry() {}
    pub(crate) fn token_refresh(_success: bool) {}
}

pub(crate) use enabled::*;
