//! Prometheus metrics for the baas server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds). bcrypt at useful costs
/// sits in the tens to hundreds of milliseconds.
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Prometheus metrics for the baas server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Requests received, by operation.
    pub requests_total: CounterVec,
    /// Requests answered by a worker, by operation.
    pub requests_processed_total: CounterVec,
    /// Requests that had to wait in the queue.
    pub requests_queued_total: Counter,
    /// Requests declined because the queue was full.
    pub requests_rejected_total: Counter,
    /// Time from dispatch to completion, by operation.
    pub request_duration: HistogramVec,
    /// Requests currently waiting for a worker.
    pub queue_length: Gauge,
    /// Workers currently idle.
    pub workers_idle: Gauge,
    /// Connections closed because of a malformed frame.
    pub protocol_errors_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "baas_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "baas_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("baas_requests_total", "Total requests received by operation"),
            &["operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_processed_total = CounterVec::new(
            Opts::new(
                "baas_requests_processed_total",
                "Total requests processed by a worker by operation",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(requests_processed_total.clone()))?;

        let requests_queued_total = Counter::with_opts(Opts::new(
            "baas_requests_queued_total",
            "Total requests that waited for a worker",
        ))?;
        registry.register(Box::new(requests_queued_total.clone()))?;

        let requests_rejected_total = Counter::with_opts(Opts::new(
            "baas_requests_rejected_total",
            "Total requests answered busy because the queue was full",
        ))?;
        registry.register(Box::new(requests_rejected_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "baas_request_duration_seconds",
                "Request duration in seconds by operation",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Worker pool
        let queue_length = Gauge::with_opts(Opts::new(
            "baas_queue_length",
            "Requests waiting for an idle worker",
        ))?;
        registry.register(Box::new(queue_length.clone()))?;

        let workers_idle = Gauge::with_opts(Opts::new(
            "baas_workers_idle",
            "Number of idle workers",
        ))?;
        registry.register(Box::new(workers_idle.clone()))?;

        let protocol_errors_total = Counter::with_opts(Opts::new(
            "baas_protocol_errors_total",
            "Connections closed because of a malformed frame",
        ))?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            requests_total,
            requests_processed_total,
            requests_queued_total,
            requests_rejected_total,
            request_duration,
            queue_length,
            workers_idle,
            protocol_errors_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let metric_families = self.registry.gather();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = plain(StatusCode::OK, body);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                plain(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
            }
        },
        "/health" | "/healthz" => plain(StatusCode::OK, "OK"),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
