//! # Prometheus Metrics
//!
//! Exposes escrow activity for the devnet node. Scraped by Prometheus at the
//! `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use keystone_contracts::EscrowEvent;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are reference-counted) so it can be
/// shared across request handlers.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Listings accepted into escrow.
    pub listings_created_total: IntCounter,
    /// Sales closed with title and funds swapped.
    pub sales_finalized_total: IntCounter,
    /// Sales aborted by buyer or seller.
    pub sales_cancelled_total: IntCounter,
    /// Ledger calls that failed and were rolled back, by error kind.
    pub rejected_calls_total: IntCounterVec,
    /// Listings currently pending.
    pub open_listings: IntGauge,
    /// Balance of the ledger's custody account.
    pub custody_balance: IntGauge,
    /// Histogram of JSON-RPC request latency in seconds.
    pub rpc_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("keystone".into()), None)
            .expect("failed to create prometheus registry");

        let listings_created_total =
            IntCounter::new("listings_created_total", "Total number of listings created")
                .expect("metric creation");
        registry
            .register(Box::new(listings_created_total.clone()))
            .expect("metric registration");

        let sales_finalized_total =
            IntCounter::new("sales_finalized_total", "Total number of finalized sales")
                .expect("metric creation");
        registry
            .register(Box::new(sales_finalized_total.clone()))
            .expect("metric registration");

        let sales_cancelled_total =
            IntCounter::new("sales_cancelled_total", "Total number of cancelled sales")
                .expect("metric creation");
        registry
            .register(Box::new(sales_cancelled_total.clone()))
            .expect("metric registration");

        let rejected_calls_total = IntCounterVec::new(
            Opts::new(
                "rejected_calls_total",
                "Total number of ledger calls rolled back, by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(rejected_calls_total.clone()))
            .expect("metric registration");

        let open_listings = IntGauge::new("open_listings", "Number of pending listings")
            .expect("metric creation");
        registry
            .register(Box::new(open_listings.clone()))
            .expect("metric registration");

        let custody_balance = IntGauge::new(
            "custody_balance",
            "Balance held by the ledger's custody account, in the smallest unit",
        )
        .expect("metric creation");
        registry
            .register(Box::new(custody_balance.clone()))
            .expect("metric registration");

        let rpc_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("rpc_latency_seconds", "JSON-RPC request latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(rpc_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            listings_created_total,
            sales_finalized_total,
            sales_cancelled_total,
            rejected_calls_total,
            open_listings,
            custody_balance,
            rpc_latency_seconds,
        }
    }

    /// Updates counters for a journal entry produced by a successful call.
    pub fn observe_event(&self, event: &EscrowEvent) {
        match event {
            EscrowEvent::Listed { .. } => {
                self.listings_created_total.inc();
                self.open_listings.inc();
            }
            EscrowEvent::SaleFinalized { .. } => {
                self.sales_finalized_total.inc();
                self.open_listings.dec();
            }
            EscrowEvent::SaleCancelled { .. } => {
                self.sales_cancelled_total.inc();
                self.open_listings.dec();
            }
            _ => {}
        }
    }

    /// Records the ledger's custody balance, saturating at `i64::MAX`.
    pub fn set_custody_balance(&self, balance: u64) {
        self.custody_balance
            .set(i64::try_from(balance).unwrap_or(i64::MAX));
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
