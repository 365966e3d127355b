//! The HTTP scrape dispatcher: routes a request path to the right registry and renders
//! Prometheus exposition text. Grounded in `metrics-exporter-prometheus`'s
//! `http_listener.rs`, generalized to route on path (`/healthz`, `/metricz`, `/{service}`)
//! instead of always rendering a single, process-wide registry.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::child::ChildSnapshot;
use crate::collector::Collector;
use crate::formatting::{sanitize_label_key, sanitize_metric_name, write_help_line, write_metric_line, write_type_line};
use crate::registry::Registry;
use crate::registry_index::SELF_METRICS_SERVICE;
use crate::sample::SampleKind;
use crate::vector::Vector;

/// Body returned for any path that isn't `/healthz`, `/metricz`, or a known service —
/// including `/favicon.ico` — so existing scrapers that expect a non-5xx keep working.
const NOT_FOUND_BODY: &str = "End Point not exist";

/// Binds `addr` and serves scrape requests until `shutdown` fires.
pub async fn run(addr: SocketAddr, collector: Arc<Collector>, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "scrape listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let collector = Arc::clone(&collector);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let collector = Arc::clone(&collector);
                        async move { Ok::<_, hyper::Error>(handle(&collector, &req)) }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                        warn!(error = ?err, "error serving scrape connection");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scrape listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn handle(collector: &Collector, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if path == "/healthz" {
        return json_response("ok\n");
    }
    if path == "/metricz" {
        let body = collector.self_metrics().render(collector.clock(), collector.uptime());
        return text_response(body);
    }

    let service = path.trim_start_matches('/');
    if service.is_empty() || service == SELF_METRICS_SERVICE {
        return text_response(NOT_FOUND_BODY.to_string());
    }

    match collector.registry_for(service) {
        Some(registry) => text_response(render_registry(&registry)),
        None => text_response(NOT_FOUND_BODY.to_string()),
    }
}

/// Renders every vector in `registry`, in first-seen order, as Prometheus exposition text.
pub fn render_registry(registry: &Registry) -> String {
    let mut buf = String::new();
    for (name, vector) in registry.vectors() {
        render_vector(&mut buf, &name, &vector);
    }
    buf
}

fn render_vector(buf: &mut String, name: &str, vector: &Vector) {
    let name = sanitize_metric_name(name);
    let help = vector.help().unwrap_or_else(|| "auto".to_string());
    write_help_line(buf, &name, &help);
    write_type_line(buf, &name, metric_type(vector.kind()));

    let label_names = vector.label_names();
    vector.with_children(|children| {
        for child in children {
            let labels: Vec<(String, String)> = label_names
                .iter()
                .map(|n| (sanitize_label_key(n), child.labels().get(n).cloned().unwrap_or_default()))
                .collect();

            match child.snapshot() {
                ChildSnapshot::Counter(value) | ChildSnapshot::Gauge(value) => {
                    write_metric_line(buf, &name, None, &as_refs(&labels), value);
                }
                ChildSnapshot::Histogram(snapshot) => {
                    for (bound, count) in snapshot.bounds.iter().zip(snapshot.cumulative_counts.iter()) {
                        let bound_str = crate::formatting::format_value(*bound);
                        let mut bucket_labels = labels.clone();
                        bucket_labels.push(("le".to_string(), bound_str));
                        write_metric_line(buf, &name, Some("_bucket"), &as_refs(&bucket_labels), *count as f64);
                    }
                    let mut inf_labels = labels.clone();
                    inf_labels.push(("le".to_string(), "+Inf".to_string()));
                    write_metric_line(buf, &name, Some("_bucket"), &as_refs(&inf_labels), snapshot.count as f64);
                    write_metric_line(buf, &name, Some("_sum"), &as_refs(&labels), snapshot.sum);
                    write_metric_line(buf, &name, Some("_count"), &as_refs(&labels), snapshot.count as f64);
                }
            }
        }
    });
    buf.push('\n');
}

fn as_refs(labels: &[(String, String)]) -> Vec<(&str, &str)> {
    labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

fn metric_type(kind: SampleKind) -> &'static str {
    match kind {
        SampleKind::Counter => "counter",
        SampleKind::Gauge => "gauge",
        SampleKind::Histogram | SampleKind::HistogramLinear => "histogram",
    }
}

fn text_response(body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}

fn json_response(body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
