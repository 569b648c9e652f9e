use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use crate::storage::DatabaseStats;

/// Counters and gauges for the admission engine, prefixed `pinclaim_`.
pub struct Metrics {
    registry: Registry,
    pub claims_submitted: IntCounter,
    pub claims_rejected: IntCounter,
    pub claims_deleted: IntCounter,
    pub pins_succeeded: IntCounter,
    pub fetch_failures: IntCounter,
    pub unit_timeouts: IntCounter,
    pub price_fallbacks: IntCounter,
    pub sweeps: IntCounter,
    pub dispatch_dropped: IntCounter,
    pub tracked_pins: IntGauge,
    pub executor_running: IntGauge,
    pub claims_stored: IntGauge,
    pub claims_pinned: IntGauge,
    pub claims_unprocessed: IntGauge,
    pub local_pins_stored: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            claims_submitted: counter(&registry, "pinclaim_claims_submitted_total", "Pin claims received")?,
            claims_rejected: counter(&registry, "pinclaim_claims_rejected_total", "Pin claims rejected at admission")?,
            claims_deleted: counter(&registry, "pinclaim_claims_deleted_total", "Claim records deleted after failing validation")?,
            pins_succeeded: counter(&registry, "pinclaim_pins_succeeded_total", "Objects validated and pinned")?,
            fetch_failures: counter(&registry, "pinclaim_fetch_failures_total", "Failed object fetches")?,
            unit_timeouts: counter(&registry, "pinclaim_unit_timeouts_total", "Executor units abandoned after timeout")?,
            price_fallbacks: counter(&registry, "pinclaim_price_fallbacks_total", "Write price resolutions that used the fallback constant")?,
            sweeps: counter(&registry, "pinclaim_sweeps_total", "Completed reconciliation sweeps")?,
            dispatch_dropped: counter(&registry, "pinclaim_dispatch_dropped_total", "Dispatches dropped because the work queue was full")?,
            tracked_pins: gauge(&registry, "pinclaim_tracked_pins", "Objects with a fetch/validate attempt in flight")?,
            executor_running: gauge(&registry, "pinclaim_executor_running", "Executor units holding a permit")?,
            claims_stored: gauge(&registry, "pinclaim_claims_stored", "Claim records in the store")?,
            claims_pinned: gauge(&registry, "pinclaim_claims_pinned", "Claim records whose object is pinned")?,
            claims_unprocessed: gauge(&registry, "pinclaim_claims_unprocessed", "Claim records with undecided validity")?,
            local_pins_stored: gauge(&registry, "pinclaim_local_pins_stored", "Operator local pins in the store")?,
            registry,
        })
    }

    pub fn observe_store(&self, stats: &DatabaseStats) {
        self.claims_stored.set(stats.claim_count as i64);
        self.claims_pinned.set(stats.pinned_count as i64);
        self.claims_unprocessed.set(stats.unprocessed_count as i64);
        self.local_pins_stored.set(stats.local_pin_count as i64);
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

pub fn serve(cfg: crate::config::Metrics, metrics: Arc<Metrics>) -> Result<()> {
    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid metrics content-type header"))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::Builder::new().name("metrics-http".into()).spawn(move || {
        for request in server.incoming_requests() {
            let body = match metrics.render() {
                Ok(b) => b,
                Err(e) => {
                    error!("could not encode metrics: {e}");
                    continue;
                }
            };
            let response = tiny_http::Response::from_data(body).with_header(header.clone());
            let _ = request.respond(response);
        }
    })?;

    Ok(())
}
