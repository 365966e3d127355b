//! End-to-end aggregation scenarios, driven directly against [`Collector`]/[`Registry`]
//! rather than real TCP/HTTP sockets, per the scenarios in the specification's testable
//! properties section.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use prom_aggregator::collector::Collector;
use prom_aggregator::registry_index::RegistryIndex;
use prom_aggregator::sample::Sample;
use prom_aggregator::scrape::render_registry;
use prom_aggregator::selfmetrics::SelfMetrics;

fn sample(service: &str, name: &str, kind: &str, labels: &[(&str, &str)], value: f64) -> Sample {
    Sample {
        service: service.into(),
        name: name.into(),
        kind_raw: kind.into(),
        labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        value,
        histogram_def: Vec::new(),
    }
}

fn new_collector(queue_size: usize, ttl: Duration, tick: Duration) -> Arc<Collector> {
    Arc::new(Collector::new(
        Arc::new(RegistryIndex::new()),
        Arc::new(SelfMetrics::new()),
        queue_size,
        ttl,
        tick,
    ))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn counter_basic() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    for _ in 0..3 {
        collector.write(sample("shop", "req_total", "c", &[("route", "/x")], 1.0)).unwrap();
    }
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    let text = render_registry(&registry);
    assert!(text.contains(r#"req_total{route="/x"} 3"#), "{text}");

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn gauge_last_write_wins() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    collector.write(sample("shop", "foo", "g", &[], 5.0)).unwrap();
    settle().await;
    collector.write(sample("shop", "foo", "g", &[], 2.0)).unwrap();
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    let text = render_registry(&registry);
    assert!(text.contains("foo 2"), "{text}");
    assert!(!text.contains("foo 5"), "{text}");

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn dynamic_label_expansion() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    collector.write(sample("shop", "hits", "c", &[("a", "1")], 1.0)).unwrap();
    settle().await;
    collector.write(sample("shop", "hits", "c", &[("a", "1"), ("b", "2")], 1.0)).unwrap();
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    let text = render_registry(&registry);
    assert!(text.contains(r#"hits{a="1",b=""} 1"#), "{text}");
    assert!(text.contains(r#"hits{a="1",b="2"} 1"#), "{text}");

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn expiration_drops_and_recreates_children() {
    let ttl = Duration::from_millis(120);
    let collector = new_collector(64, ttl, Duration::from_millis(40));
    collector.start();

    collector.write(sample("shop", "x", "c", &[], 1.0)).unwrap();
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    assert!(render_registry(&registry).contains("x 1"));

    tokio::time::sleep(ttl + Duration::from_millis(150)).await;
    let after_expiry = render_registry(&registry);
    assert!(
        !after_expiry.lines().any(|line| line == "x 1"),
        "expected no surviving data line for `x`, got:\n{after_expiry}"
    );

    collector.write(sample("shop", "x", "c", &[], 1.0)).unwrap();
    settle().await;
    assert!(render_registry(&registry).contains("x 1"));

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn kind_conflict_preserves_existing_vector() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    collector.write(sample("shop", "cpu", "c", &[], 1.0)).unwrap();
    settle().await;
    collector.write(sample("shop", "cpu", "g", &[], 0.5)).unwrap();
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    let text = render_registry(&registry);
    assert!(text.contains("# TYPE cpu counter"), "{text}");
    assert!(text.contains("cpu 1"), "{text}");

    let self_metrics_text = collector.self_metrics().render(collector.clock(), collector.uptime());
    assert!(
        self_metrics_text.contains(r#"app_collector_dropped_samples_total{reason="kind_conflict"} 1"#),
        "{self_metrics_text}"
    );

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn queue_backpressure_rejects_third_write() {
    let collector = new_collector(2, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    // No `.await` between these calls: on the current-thread test runtime, the folding
    // task has no opportunity to drain the queue before the third `write` observes it full.
    collector.write(sample("shop", "reqs", "c", &[], 1.0)).unwrap();
    collector.write(sample("shop", "reqs", "c", &[], 1.0)).unwrap();
    let result = collector.write(sample("shop", "reqs", "c", &[], 1.0));
    assert!(result.is_err());

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn reserved_service_name_is_rejected() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    collector.write(sample("metricz", "evil", "c", &[], 1.0)).unwrap();
    settle().await;

    let registry = collector.registry_for("metricz").unwrap();
    assert!(render_registry(&registry).is_empty());

    collector.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn labels_are_sample_order_independent() {
    let collector = new_collector(64, Duration::from_secs(100), Duration::from_secs(1));
    collector.start();

    let mut reordered: BTreeMap<String, String> =
        [("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())].into_iter().collect();
    let mut s = sample("shop", "ordered", "g", &[], 1.0);
    s.labels = std::mem::take(&mut reordered);
    collector.write(s).unwrap();
    settle().await;

    let registry = collector.registry_for("shop").unwrap();
    let text = render_registry(&registry);
    assert!(text.contains(r#"ordered{a="1",b="2"} 1"#), "{text}");

    collector.stop(Duration::from_secs(1)).await.unwrap();
}
