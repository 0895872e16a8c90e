use std::{sync::Arc, time::Duration};

use sigscope_rs::{
    cfg::config::Config,
    correlate::engine::{ClosedSummary, KpiEvent},
    dict::Dictionary,
    kpi::{engine::KpiEngine, sketch::QuantileSketch, window::KpiStore},
};
use tokio::sync::mpsc;

use super::{at, test_config};

#[test]
fn test_sketch_quantiles_within_relative_error() {
    let mut sketch = QuantileSketch::default();
    for i in 1..=10_000 {
        sketch.add(f64::from(i));
    }

    assert_eq!(sketch.count(), 10_000);
    assert_eq!(sketch.min(), Some(1.0));
    assert_eq!(sketch.max(), Some(10_000.0));

    // 1% relative accuracy, with a little slack for bucket midpoints.
    for (q, expected) in [(0.50, 5_000.0), (0.95, 9_500.0), (0.99, 9_900.0)] {
        let got = sketch.quantile(q).expect("non-empty sketch");
        let err = (got - expected).abs() / expected;
        assert!(err < 0.03, "q{q}: got {got}, expected ~{expected}");
    }
}

#[test]
fn test_sketch_merge_matches_combined() {
    let mut a = QuantileSketch::default();
    let mut b = QuantileSketch::default();
    let mut all = QuantileSketch::default();
    for i in 1..=500 {
        a.add(f64::from(i));
        all.add(f64::from(i));
    }
    for i in 501..=1_000 {
        b.add(f64::from(i));
        all.add(f64::from(i));
    }

    a.merge(&b);
    assert_eq!(a.count(), all.count());
    let qa = a.quantile(0.95).expect("merged");
    let qb = all.quantile(0.95).expect("combined");
    assert!((qa - qb).abs() / qb < 0.01);
}

#[test]
fn test_sketch_ignores_garbage() {
    let mut sketch = QuantileSketch::default();
    sketch.add(f64::NAN);
    sketch.add(-5.0);
    sketch.add(f64::INFINITY);
    assert!(sketch.is_empty());
}

#[test]
fn test_window_counters_and_causes() {
    let mut store = KpiStore::new(Duration::from_secs(3600));

    store.record_close("S6a_UpdateLocation", "Success", None, at(0));
    store.record_close("S6a_UpdateLocation", "Failure", Some(5001), at(1_000));
    store.record_close("S6a_UpdateLocation", "Failure", Some(5001), at(2_000));
    store.record_close("S6a_UpdateLocation", "Failure", Some(5012), at(3_000));
    store.record_close("S6a_UpdateLocation", "Timeout", None, at(4_000));
    store.record_latencies("S6a_UpdateLocation", &[100.0, 200.0], at(4_500));

    let snap = store.snapshot(Duration::from_secs(60), 5, at(5_000));
    let proc = snap.get("S6a_UpdateLocation").expect("procedure tracked");
    assert_eq!(proc.total, 5);
    assert_eq!(proc.success, 1);
    assert_eq!(proc.failure, 3);
    assert_eq!(proc.timeout, 1);
    assert_eq!(proc.latency.count, 2);
    assert_eq!(proc.top_causes.first(), Some(&(5001, 2)));
    assert!((proc.failure_rate() - 0.6).abs() < 1e-9);
}

#[test]
fn test_window_excludes_old_buckets() {
    let mut store = KpiStore::new(Duration::from_secs(3600));
    store.record_close("4G_Attach", "Success", None, at(0));
    store.record_close("4G_Attach", "Success", None, at(120_000));

    // The one-minute window only sees the recent close.
    let snap = store.snapshot(Duration::from_secs(60), 5, at(130_000));
    assert_eq!(snap.get("4G_Attach").map(|p| p.total), Some(1));

    // The hour window sees both.
    let snap = store.snapshot(Duration::from_secs(3600), 5, at(130_000));
    assert_eq!(snap.get("4G_Attach").map(|p| p.total), Some(2));
}

fn kpi_engine(cfg: Config) -> (Arc<KpiEngine>, mpsc::Receiver<sigscope_rs::kpi::engine::Issue>) {
    let (tx, rx) = mpsc::channel(16);
    let engine = Arc::new(KpiEngine::new(
        Arc::new(cfg),
        Arc::new(Dictionary::new()),
        tx,
    ));
    (engine, rx)
}

#[tokio::test]
async fn test_failure_rate_issue_with_diagnosis() {
    let (engine, mut issue_rx) = kpi_engine(test_config());

    for i in 0..20 {
        let outcome = if i < 5 { "Failure" } else { "Success" };
        engine
            .apply(KpiEvent::Closed(ClosedSummary {
                session_id: format!("s-{i:016x}"),
                procedure: Some("S6a_UpdateLocation"),
                outcome,
                cause: (outcome == "Failure").then_some(5001),
            }))
            .await;
    }

    let now = chrono::Utc::now();
    engine.evaluate(now).await;

    let issues = engine.issue_feed(now - chrono::Duration::hours(1)).await;
    assert_eq!(issues.len(), 1, "25% failure rate breaches the 5% threshold");
    let issue = &issues[0];
    assert_eq!(issue.procedure, "S6a_UpdateLocation");
    assert_eq!(issue.top_cause, Some(5001));
    assert_eq!(issue.reference, Some("3GPP TS 29.272 § 7.3"));
    assert!(issue.likely_causes.is_some());

    // The same breach within the window stays silent.
    engine.evaluate(now + chrono::Duration::seconds(10)).await;
    let issues = engine.issue_feed(now - chrono::Duration::hours(1)).await;
    assert_eq!(issues.len(), 1, "cooldown suppresses the repeat");

    // And the record reached the sink queue.
    let pushed = issue_rx.try_recv().expect("issue forwarded to sink");
    assert_eq!(pushed.procedure, "S6a_UpdateLocation");
}
