use std::time::Duration;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

use crate::types::DataCategory;

/// Counters for a single data category.
#[derive(Debug, Clone)]
pub struct CategoryMetrics {
    /// Items accepted into the reassembly buffer
    pub inbound: IntCounter,
    /// Items discarded (invalid, stale or unrequested)
    pub dropped: IntCounter,
    pub timeouts: IntCounter,
    /// Request round trip in seconds
    pub request_latency: Histogram,
}

impl CategoryMetrics {
    fn new(registry: &Registry, category: DataCategory) -> Result<Self, prometheus::Error> {
        let name = category.short_name();
        let inbound = IntCounter::new(
            format!("downloader_{name}_in"),
            format!("Number of {name} items accepted from peers"),
        )?;
        let dropped = IntCounter::new(
            format!("downloader_{name}_drop"),
            format!("Number of {name} items dropped"),
        )?;
        let timeouts = IntCounter::new(
            format!("downloader_{name}_timeout"),
            format!("Number of {name} requests that timed out"),
        )?;
        let request_latency = Histogram::with_opts(HistogramOpts::new(
            format!("downloader_{name}_req"),
            format!("Round trip of {name} requests in seconds"),
        ))?;
        registry.register(Box::new(inbound.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        Ok(Self {
            inbound,
            dropped,
            timeouts,
            request_latency,
        })
    }
}

/// Downloader metrics. Owns its registry, handed to the downloader as an
/// `Arc<SyncMetrics>` so several downloaders (or tests) never share counters.
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    pub registry: Registry,
    categories: [CategoryMetrics; 4],
    /// Times a fetch found no peer able to take a request
    pub throttle: IntCounter,
    pub state_fetch_fallbacks: IntCounter,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let categories = [
            CategoryMetrics::new(&registry, DataCategory::Headers)?,
            CategoryMetrics::new(&registry, DataCategory::Bodies)?,
            CategoryMetrics::new(&registry, DataCategory::Receipts)?,
            CategoryMetrics::new(&registry, DataCategory::StateNodes)?,
        ];
        let throttle = IntCounter::new(
            "downloader_throttle",
            "Number of times a fetch waited for an idle peer",
        )?;
        let state_fetch_fallbacks = IntCounter::new(
            "downloader_state_fetch_fallbacks",
            "Number of snap syncs that fell back to full import",
        )?;
        registry.register(Box::new(throttle.clone()))?;
        registry.register(Box::new(state_fetch_fallbacks.clone()))?;
        Ok(Self {
            registry,
            categories,
            throttle,
            state_fetch_fallbacks,
        })
    }

    pub fn category(&self, category: DataCategory) -> &CategoryMetrics {
        &self.categories[category.index()]
    }

    pub fn record_inbound(&self, category: DataCategory, items: usize) {
        self.category(category).inbound.inc_by(items as u64);
    }

    pub fn record_dropped(&self, category: DataCategory, items: usize) {
        self.category(category).dropped.inc_by(items as u64);
    }

    pub fn record_timeout(&self, category: DataCategory) {
        self.category(category).timeouts.inc();
    }

    pub fn record_latency(&self, category: DataCategory, elapsed: Duration) {
        self.category(category)
            .request_latency
            .observe(elapsed.as_secs_f64());
    }

    /// Renders every metric in the prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_category() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_inbound(DataCategory::Headers, 192);
        metrics.record_inbound(DataCategory::Bodies, 3);
        metrics.record_timeout(DataCategory::Bodies);
        metrics.record_dropped(DataCategory::StateNodes, 5);

        assert_eq!(metrics.category(DataCategory::Headers).inbound.get(), 192);
        assert_eq!(metrics.category(DataCategory::Bodies).inbound.get(), 3);
        assert_eq!(metrics.category(DataCategory::Bodies).timeouts.get(), 1);
        assert_eq!(metrics.category(DataCategory::Headers).timeouts.get(), 0);
        assert_eq!(metrics.category(DataCategory::StateNodes).dropped.get(), 5);
    }

    #[test]
    fn test_encode_uses_meter_names() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_latency(DataCategory::Receipts, Duration::from_millis(120));
        metrics.throttle.inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("downloader_headers_in 0"));
        assert!(text.contains("downloader_states_drop 0"));
        assert!(text.contains("downloader_receipts_req_count 1"));
        assert!(text.contains("downloader_throttle 1"));
    }

    #[test]
    fn test_instances_do_not_share_counters() {
        let first = SyncMetrics::new().unwrap();
        let second = SyncMetrics::new().unwrap();
        first.record_inbound(DataCategory::Headers, 1);
        assert_eq!(second.category(DataCategory::Headers).inbound.get(), 0);
    }
}
