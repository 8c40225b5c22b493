//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` per process. Non-real-time contexts (feed, ingest,
//! loader, status reporter) update it directly; the audio render callback never
//! touches it, its counters are mirrored in by the status reporter.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9300`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus registry plus the handles each pipeline stage reports into.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Feed
    pub packets_received_total: IntCounter,
    pub packets_rejected_total: IntCounter,

    // Block lifecycle
    pub blocks_produced_total: IntCounter,
    pub blocks_dropped_total: IntCounter,
    pub blocks_evicted_total: IntCounter,
    pub blocks_enqueued_total: IntCounter,
    pub blocks_skipped_total: IntCounter,
    pub blocks_consumed_total: IntCounter,

    // Render
    pub render_underruns_total: IntCounter,
    pub render_partial_fills_total: IntCounter,

    // Buffer gauges
    pub buffered_seconds: Gauge,
    pub underrun_seconds: Gauge,
    pub playback_queue_blocks: IntGauge,
    pub store_entries: IntGauge,

    // Latency histograms (seconds)
    pub resample_seconds: Histogram,
    pub store_write_seconds: Histogram,
    pub ingest_pipeline_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("seismic_sonifier".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let packets_received_total =
            counter("feed_packets_received_total", "Packets delivered by the feed")?;
        let packets_rejected_total = counter(
            "feed_packets_rejected_total",
            "Packets dropped because the ingest backlog was full",
        )?;

        let blocks_produced_total =
            counter("blocks_produced_total", "Blocks resampled and persisted")?;
        let blocks_dropped_total = counter(
            "blocks_dropped_total",
            "Packets or blocks dropped by resampling or store write failures",
        )?;
        let blocks_evicted_total = counter(
            "blocks_evicted_total",
            "Stored blocks removed by retention before or after playback",
        )?;
        let blocks_enqueued_total =
            counter("blocks_enqueued_total", "Blocks moved into the playback queue")?;
        let blocks_skipped_total = counter(
            "blocks_skipped_total",
            "Stored blocks that vanished or could not be read before loading",
        )?;
        let blocks_consumed_total =
            counter("blocks_consumed_total", "Blocks fully played by the render callback")?;

        let render_underruns_total = counter(
            "render_underruns_total",
            "Render callbacks that ran out of buffered audio",
        )?;
        let render_partial_fills_total = counter(
            "render_partial_fills_total",
            "Render callbacks that delivered some audio followed by silence",
        )?;

        let buffered_seconds = Gauge::with_opts(Opts::new(
            "playback_buffered_seconds",
            "Audio currently buffered in the playback queue (seconds)",
        ))?;
        let underrun_seconds = Gauge::with_opts(Opts::new(
            "render_underrun_seconds",
            "Cumulative silence emitted because of underruns (seconds)",
        ))?;
        let playback_queue_blocks = IntGauge::with_opts(Opts::new(
            "playback_queue_blocks",
            "Blocks waiting in the playback queue",
        ))?;
        let store_entries = IntGauge::with_opts(Opts::new(
            "block_store_entries",
            "Blocks currently persisted in the block store",
        ))?;

        let resample_seconds = Histogram::with_opts(HistogramOpts::new(
            "resample_seconds",
            "Time to normalize, resample and taper one packet (seconds)",
        ))?;
        let store_write_seconds = Histogram::with_opts(HistogramOpts::new(
            "store_write_seconds",
            "Time to persist one block (seconds)",
        ))?;
        let ingest_pipeline_seconds = Histogram::with_opts(HistogramOpts::new(
            "ingest_pipeline_seconds",
            "Time from packet arrival to block persisted (seconds)",
        ))?;

        let collectors: [Box<dyn Collector>; 7] = [
            Box::new(buffered_seconds.clone()),
            Box::new(underrun_seconds.clone()),
            Box::new(playback_queue_blocks.clone()),
            Box::new(store_entries.clone()),
            Box::new(resample_seconds.clone()),
            Box::new(store_write_seconds.clone()),
            Box::new(ingest_pipeline_seconds.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            packets_received_total,
            packets_rejected_total,
            blocks_produced_total,
            blocks_dropped_total,
            blocks_evicted_total,
            blocks_enqueued_total,
            blocks_skipped_total,
            blocks_consumed_total,
            render_underruns_total,
            render_partial_fills_total,
            buffered_seconds,
            underrun_seconds,
            playback_queue_blocks,
            store_entries,
            resample_seconds,
            store_write_seconds,
            ingest_pipeline_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// Callers decide whether to run it; the pipeline works without it.
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { Ok::<_, hyper::Error>(handle_metrics_request(&req, &registry)) }
                    }))
                }
            });

            Server::bind(&cfg.bind)
                .serve(make_svc)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        })
    }
}

fn handle_metrics_request(req: &Request<Body>, registry: &Registry) -> Response<Body> {
    // ---
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found".into());
    }

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}"));
    }

    let mut resp = Response::new(Body::from(buffer));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    // ---
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn metrics_context_gathers_something() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        ctx.blocks_produced_total.inc();
        let families = ctx.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "seismic_sonifier_blocks_produced_total"));
    }

    #[test]
    fn unknown_path_is_not_found() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .expect("request should build");
        let resp = handle_metrics_request(&req, &ctx.registry);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn metrics_path_serves_text_format() {
        // ---
        let ctx = MetricsContext::new("test").expect("MetricsContext should init");
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .expect("request should build");
        let resp = handle_metrics_request(&req, &ctx.registry);
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
