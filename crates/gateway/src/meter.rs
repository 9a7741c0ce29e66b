//! In-memory usage metering with a durable rollup.
//!
//! Buckets are keyed `(consumer, server, tool)` within the current hourly
//! period. A period change flushes everything to the store and clears the
//! map; a background task does the same on a fixed cadence so rollups stay
//! fresh even on quiet gateways. Reading a summary implicitly flushes, so
//! callers always see the in-memory increments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tg_domain::config::MeteringConfig;
use tg_domain::usage::{current_period_key, UsageRow, UsageSummary};
use tg_domain::Result;

use crate::store::GatewayStore;

#[derive(Default)]
struct Bucket {
    calls: u64,
    errors: u64,
    total_latency_ms: u64,
}

struct MeterState {
    period: String,
    buckets: HashMap<(String, String, String), Bucket>,
}

pub struct Meter {
    enabled: bool,
    flush_interval: Duration,
    store: Arc<dyn GatewayStore>,
    state: Mutex<MeterState>,
}

impl Meter {
    pub fn new(config: &MeteringConfig, store: Arc<dyn GatewayStore>) -> Self {
        Self {
            enabled: config.enabled,
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            store,
            state: Mutex::new(MeterState {
                period: current_period_key(),
                buckets: HashMap::new(),
            }),
        }
    }

    /// Record one call. A no-op when metering is disabled.
    pub fn record(
        &self,
        consumer_id: &str,
        server_id: &str,
        tool: &str,
        latency_ms: u64,
        is_error: bool,
    ) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        let period = current_period_key();
        if state.period != period {
            Self::flush_locked(&self.store, &mut state);
            state.period = period;
        }
        let bucket = state
            .buckets
            .entry((
                consumer_id.to_string(),
                server_id.to_string(),
                tool.to_string(),
            ))
            .or_default();
        bucket.calls += 1;
        if is_error {
            bucket.errors += 1;
        }
        bucket.total_latency_ms += latency_ms;
    }

    /// Push every in-memory bucket into the durable rollup and clear.
    pub fn flush(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock();
        Self::flush_locked(&self.store, &mut state);
        state.period = current_period_key();
    }

    /// Rows that fail to upsert are dropped after a warning; counters are
    /// best-effort once they leave memory.
    fn flush_locked(store: &Arc<dyn GatewayStore>, state: &mut MeterState) {
        for ((consumer_id, server_id, tool), bucket) in state.buckets.drain() {
            let row = UsageRow {
                consumer_id,
                server_id,
                tool,
                period_key: state.period.clone(),
                calls: bucket.calls,
                errors: bucket.errors,
                total_latency_ms: bucket.total_latency_ms,
            };
            if let Err(e) = store.upsert_usage(&row) {
                tracing::warn!(error = %e, "usage rollup write failed");
            }
        }
    }

    /// Aggregate usage, optionally scoped to one consumer. Flushes first so
    /// the rollup includes everything recorded so far. Disabled metering
    /// returns zeroed summaries.
    pub fn summary(&self, consumer_id: Option<&str>) -> Result<UsageSummary> {
        if !self.enabled {
            return Ok(UsageSummary::default());
        }
        self.flush();
        let rows = self.store.query_usage(consumer_id)?;
        Ok(UsageSummary::from_rows(&rows))
    }

    /// Spawn the periodic background flush.
    pub fn spawn_flush_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let meter = Arc::clone(self);
        let interval = meter.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                meter.flush();
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
