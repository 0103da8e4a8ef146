use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "trade_bench".to_string());

    // === Request Metrics ===

    pub static ref ATTEMPTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("attempts_total", "Total number of physical HTTP attempts made")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Logical requests completed, by method and status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["method", "status_code"]
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "Elapsed time of successful logical requests in seconds, retries included."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RETRIES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("retries_total", "Attempts repeated within one logical request")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reason"]  // reason: server_error, network_error, ...
        ).unwrap();

    // === User Metrics ===

    pub static ref RETIREMENTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("retirements_total", "Simulated users that gave up")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reason"]  // reason: timeout, slow_response, transport_budget
        ).unwrap();

    pub static ref ACTIVE_USERS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_users", "Simulated users currently generating load")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Cache Metrics ===

    pub static ref CACHE_CONDITIONAL_REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("cache_conditional_requests_total", "GET requests sent with cache validators")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CACHE_LOCAL_HITS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("cache_local_hits_total", "GET requests answered from a locally fresh entry")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CACHE_STORE_DECISIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("cache_store_decisions_total", "Outcome of cache store decisions on 200 GET responses")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // outcome: stored, cleared, skipped
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(ATTEMPTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(RETRIES_TOTAL.clone()))?;

    registry.register(Box::new(RETIREMENTS_TOTAL.clone()))?;
    registry.register(Box::new(ACTIVE_USERS.clone()))?;

    registry.register(Box::new(CACHE_CONDITIONAL_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(CACHE_LOCAL_HITS_TOTAL.clone()))?;
    registry.register(Box::new(CACHE_STORE_DECISIONS_TOTAL.clone()))?;

    Ok(())
}

fn encode_metrics(registry: &Arc<Mutex<Registry>>) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match encode_metrics(&registry) {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            let mut response = Response::new(Body::from("failed to encode metrics"));
            *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry = registry.clone();
                async move { metrics_handler(req, registry).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(port, addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    match encode_metrics(registry).map(String::from_utf8) {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            error!(error = %e, "Metrics output was not UTF-8");
            String::from("# ERROR ENCODING METRICS TO UTF-8")
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            String::from("# ERROR ENCODING METRICS")
        }
    }
}
