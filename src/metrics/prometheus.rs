//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "volsync_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "volsync_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "volsync_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// 1 while a replication is behind its schedule or failing
    pub static ref OUT_OF_SYNC: GaugeVec = register_gauge_vec!(
        "volsync_volume_out_of_sync",
        "Set to 1 if the volume is not properly synchronized",
        &["obj_name", "obj_namespace", "role", "method"]
    ).unwrap();

    /// Scheduled syncs that started late because the previous one overran
    pub static ref MISSED_INTERVALS: CounterVec = register_counter_vec!(
        "volsync_missed_intervals_total",
        "The number of times a synchronization failed to complete before the next scheduled start",
        &["obj_name", "obj_namespace", "role", "method"]
    ).unwrap();

    /// Wall clock time of completed syncs
    pub static ref SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "volsync_sync_duration_seconds",
        "Duration of the synchronization interval in seconds",
        &["obj_name", "obj_namespace", "role", "method"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 21600.0]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "volsync_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Replication metrics of one CR, bound to its label values
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncMetrics {
    labels: [String; 4],
}

impl SyncMetrics {
    /// `role` is `source` or `destination`; `method` names the mover
    pub fn new(name: &str, namespace: &str, role: &str, method: &str) -> Self {
        Self {
            labels: [
                name.to_string(),
                namespace.to_string(),
                role.to_string(),
                method.to_string(),
            ],
        }
    }

    fn label_values(&self) -> [&str; 4] {
        [
            self.labels[0].as_str(),
            self.labels[1].as_str(),
            self.labels[2].as_str(),
            self.labels[3].as_str(),
        ]
    }

    pub fn set_out_of_sync(&self, out_of_sync: bool) {
        OUT_OF_SYNC
            .with_label_values(&self.label_values())
            .set(if out_of_sync { 1.0 } else { 0.0 });
    }

    pub fn missed_interval(&self) {
        MISSED_INTERVALS
            .with_label_values(&self.label_values())
            .inc();
    }

    pub fn observe_sync_duration(&self, seconds: f64) {
        SYNC_DURATION
            .with_label_values(&self.label_values())
            .observe(seconds);
    }

    /// Drop the series of a CR that no longer exists
    pub fn remove(&self) {
        let values = self.label_values();
        let _ = OUT_OF_SYNC.remove_label_values(&values);
        let _ = MISSED_INTERVALS.remove_label_values(&values);
        let _ = SYNC_DURATION.remove_label_values(&values);
    }
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

fn ready_response() -> Response<Full<Bytes>> {
    if OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(route("/healthz").status(), StatusCode::OK);
        assert_eq!(route("/metrics").status(), StatusCode::OK);
        assert_eq!(route("/nope").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_sync_metrics_are_labelled_per_object() {
        let m = SyncMetrics::new("metrics-test", "ns1", "source", "restic");
        m.set_out_of_sync(true);
        assert_eq!(
            OUT_OF_SYNC
                .with_label_values(&["metrics-test", "ns1", "source", "restic"])
                .get(),
            1.0
        );
        m.set_out_of_sync(false);
        assert_eq!(
            OUT_OF_SYNC
                .with_label_values(&["metrics-test", "ns1", "source", "restic"])
                .get(),
            0.0
        );

        m.missed_interval();
        m.missed_interval();
        assert_eq!(
            MISSED_INTERVALS
                .with_label_values(&["metrics-test", "ns1", "source", "restic"])
                .get(),
            2.0
        );
    }
}
